//! Resource governor: drives one guest under a deadline, a memory ceiling
//! and the network proxy's breach signals.
//!
//! ```text
//! Idle -> Running -> Completed | TimedOut | MemoryExceeded | NetworkExceeded | Cancelled
//! ```
//!
//! Exactly one terminal state is reached per run. When several conditions
//! hold at once the winner is, in order: `TimedOut`, `MemoryExceeded`,
//! `NetworkExceeded`, `Cancelled`, `Completed`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::{IsolatedContext, NetworkFault};
use crate::error::SandboxError;
use crate::policy::{MonitoringPolicy, ResourcePolicy};
use crate::types::{LogLine, SandboxMetrics, SecurityViolation, Severity, ViolationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    TimedOut,
    MemoryExceeded,
    NetworkExceeded,
    Cancelled,
}

/// How a governed run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The guest settled first. Guest errors land here too.
    Completed(Result<Value, SandboxError>),
    TimedOut { limit: Duration },
    MemoryExceeded { used: u64, limit: u64 },
    NetworkExceeded(NetworkFault),
    Cancelled,
}

impl Termination {
    pub fn state(&self) -> RunState {
        match self {
            Self::Completed(_) => RunState::Completed,
            Self::TimedOut { .. } => RunState::TimedOut,
            Self::MemoryExceeded { .. } => RunState::MemoryExceeded,
            Self::NetworkExceeded(_) => RunState::NetworkExceeded,
            Self::Cancelled => RunState::Cancelled,
        }
    }

    /// The guest's value, or the error the run ended with.
    pub fn into_result(self) -> Result<Value, SandboxError> {
        match self {
            Self::Completed(result) => result,
            Self::TimedOut { limit } => Err(SandboxError::ExecutionTimeout {
                limit_ms: limit.as_millis() as u64,
            }),
            Self::MemoryExceeded { used, limit } => {
                Err(SandboxError::MemoryLimitExceeded { used, limit })
            }
            Self::NetworkExceeded(fault) => Err(fault.to_error()),
            Self::Cancelled => Err(SandboxError::Cancelled),
        }
    }
}

/// Everything observed during a run, finalized once.
#[derive(Debug, Clone)]
pub struct GovernorReport {
    pub termination: Termination,
    pub metrics: SandboxMetrics,
    pub logs: Vec<LogLine>,
    pub violations: Vec<SecurityViolation>,
}

/// Cancels a run from outside. Cloneable and idempotent.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Puts a built context under governance. Nothing runs until
/// [`GovernedRun::run`].
pub fn govern(
    context: IsolatedContext,
    resource: &ResourcePolicy,
    monitoring: &MonitoringPolicy,
) -> GovernedRun {
    GovernedRun {
        context,
        resource: resource.clone(),
        monitoring: monitoring.clone(),
        state: RunState::Idle,
        cancel: CancelHandle::new(),
    }
}

pub struct GovernedRun {
    context: IsolatedContext,
    resource: ResourcePolicy,
    monitoring: MonitoringPolicy,
    state: RunState,
    cancel: CancelHandle,
}

impl GovernedRun {
    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Uses a caller-owned handle instead of the run's own.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(mut self) -> GovernorReport {
        self.state = RunState::Running;
        let limit = self.resource.execution_timeout;
        let max_memory = self.resource.max_memory_bytes;

        let host = self.context.host();
        let entry = self.context.entry.clone();
        let props = self.context.props.clone();
        let gauge = self.context.gauge.clone();
        let network = self.context.network.clone();

        let started = Instant::now();
        let deadline_at = started + limit;
        debug!(
            component = %self.context.component_name,
            timeout_ms = self.resource.execution_timeout_ms(),
            max_memory,
            "Guest started"
        );

        let mut guest = tokio::spawn(async move { entry.invoke(host, props).await });

        let (memory_tx, mut memory_rx) = oneshot::channel::<u64>();
        let sampler = {
            let gauge = gauge.clone();
            let period = self.monitoring.memory_sample_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let used = gauge.sample();
                    if used > max_memory {
                        let _ = memory_tx.send(used);
                        break;
                    }
                }
            })
        };

        let deadline = tokio::time::sleep_until(deadline_at);
        tokio::pin!(deadline);
        let mut cancel_rx = self.cancel.subscribe();

        let first = tokio::select! {
            biased;
            _ = &mut deadline => Termination::TimedOut { limit },
            Ok(used) = &mut memory_rx => Termination::MemoryExceeded { used, limit: max_memory },
            Some(fault) = self.context.faults.recv() => Termination::NetworkExceeded(fault),
            _ = cancelled(&mut cancel_rx) => Termination::Cancelled,
            joined = &mut guest => Termination::Completed(flatten(joined)),
        };
        let guest_settled = matches!(first, Termination::Completed(_));
        let termination = self.settle(first, deadline_at);

        sampler.abort();
        network.close();
        if !guest_settled {
            guest.abort();
            // Make sure the guest (and any child process) is gone before reporting.
            let _ = guest.await;
        }

        let elapsed = started.elapsed();
        self.state = termination.state();
        self.record_resource_violation(&termination);

        let violations = self.context.violations.snapshot();
        let metrics = SandboxMetrics {
            execution_time_ms: elapsed.as_millis() as u64,
            peak_memory_bytes: gauge.peak(),
            cpu_time_ms: gauge.cpu_time().unwrap_or(elapsed).as_millis() as u64,
            network_request_count: network.request_count(),
            violations: violations.iter().map(|v| v.message.clone()).collect(),
        };

        match self.state {
            RunState::Completed => info!(
                elapsed_ms = metrics.execution_time_ms,
                requests = metrics.network_request_count,
                "Guest completed"
            ),
            state => warn!(
                state = ?state,
                elapsed_ms = metrics.execution_time_ms,
                "Guest preempted"
            ),
        }

        GovernorReport {
            termination,
            metrics,
            logs: self.context.logs.snapshot(),
            violations,
        }
    }

    /// Several conditions can hold by the time one branch wins the race;
    /// the highest-priority one is reported.
    fn settle(&mut self, first: Termination, deadline_at: Instant) -> Termination {
        let limit = self.resource.execution_timeout;
        let max_memory = self.resource.max_memory_bytes;

        if matches!(first, Termination::TimedOut { .. }) || Instant::now() >= deadline_at {
            return Termination::TimedOut { limit };
        }
        if matches!(first, Termination::MemoryExceeded { .. }) {
            return first;
        }
        let used = self.context.gauge.sample();
        if used > max_memory {
            return Termination::MemoryExceeded {
                used,
                limit: max_memory,
            };
        }
        if matches!(first, Termination::NetworkExceeded(_)) {
            return first;
        }
        if let Ok(fault) = self.context.faults.try_recv() {
            return Termination::NetworkExceeded(fault);
        }
        if matches!(first, Termination::Cancelled) || self.cancel.is_cancelled() {
            return Termination::Cancelled;
        }
        first
    }

    fn record_resource_violation(&self, termination: &Termination) {
        let violation = match termination {
            Termination::TimedOut { limit } => SecurityViolation::new(
                ViolationKind::Resource,
                Severity::High,
                format!("execution exceeded {} ms", limit.as_millis()),
            )
            .with_context(json!({ "limitMs": limit.as_millis() as u64 })),
            Termination::MemoryExceeded { used, limit } => SecurityViolation::new(
                ViolationKind::Resource,
                Severity::High,
                format!("memory usage of {used} bytes exceeded {limit} bytes"),
            )
            .with_context(json!({ "usedBytes": used, "limitBytes": limit })),
            _ => return,
        };
        self.context.violations.push(violation);
    }
}

fn flatten(joined: Result<Result<Value, SandboxError>, JoinError>) -> Result<Value, SandboxError> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(SandboxError::GuestRuntime("guest panicked".to_string())),
        Err(_) => Err(SandboxError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::network::tests::StubTransport;
    use crate::context::{ContextBuilder, FetchRequest, GuestHost};
    use crate::isolation::InProcessBackend;
    use crate::policy::{compile, CompiledPolicy};
    use crate::types::{NetworkLimits, ResourceLimits, SecurityConfig};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use serde_json::Map;

    const SOURCE: &str = "export const Guest = () => null";

    fn policy(timeout_ms: u64, max_memory_bytes: u64) -> CompiledPolicy {
        compile(&SecurityConfig {
            resource_limits: ResourceLimits {
                execution_timeout_ms: Some(timeout_ms),
                max_memory_bytes: Some(max_memory_bytes),
                ..Default::default()
            },
            network: NetworkLimits {
                allowed_hosts: ["api.example.com".to_string()].into_iter().collect(),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    fn governed<F>(policy: &CompiledPolicy, guest: F) -> (GovernedRun, GuestHost)
    where
        F: Fn(GuestHost, Value) -> BoxFuture<'static, Result<Value, SandboxError>>
            + Send
            + Sync
            + 'static,
    {
        let backend = InProcessBackend::new().with_fn("Guest", guest);
        let context = ContextBuilder::new(Arc::new(backend))
            .with_transport(Arc::new(StubTransport::with_body("ok")))
            .build(SOURCE, "Guest", &Map::new(), policy)
            .unwrap();
        let host = context.host();
        (govern(context, &policy.resource, &policy.monitoring), host)
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_run_reports_value_and_metrics() {
        let policy = policy(1_000, 1 << 20);
        let (run, _) = governed(&policy, |host, _| {
            async move {
                host.fetch(FetchRequest::get("https://api.example.com/"))
                    .await?;
                host.log(crate::types::LogLevel::Info, "rendered");
                Ok::<_, SandboxError>(json!({ "html": "<p>hi</p>" }))
            }
            .boxed()
        });
        assert_eq!(run.state(), RunState::Idle);

        let report = run.run().await;
        assert_eq!(report.termination.state(), RunState::Completed);
        assert_eq!(
            report.termination.into_result().unwrap(),
            json!({ "html": "<p>hi</p>" })
        );
        assert_eq!(report.metrics.network_request_count, 1);
        assert_eq!(report.logs.len(), 1);
        assert!(report.violations.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_preempts_slow_guest() {
        let policy = policy(10, 1 << 20);
        let (run, _) = governed(&policy, |_, _| {
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(Value::Null)
            }
            .boxed()
        });
        let report = run.run().await;

        assert_eq!(
            report.termination,
            Termination::TimedOut {
                limit: Duration::from_millis(10)
            }
        );
        assert!(report.metrics.execution_time_ms >= 10);
        assert!(report.metrics.execution_time_ms < 45);
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.violations[0].kind, ViolationKind::Resource);
        assert_eq!(
            report.termination.into_result().unwrap_err().to_string(),
            "ExecutionTimeout"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sampler_catches_memory_breach() {
        let policy = policy(5_000, 1_000);
        let (run, _) = governed(&policy, |host, _| {
            async move {
                host.allocate(4_096);
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok(Value::Null)
            }
            .boxed()
        });
        let report = run.run().await;
        assert_eq!(
            report.termination,
            Termination::MemoryExceeded {
                used: 4_096,
                limit: 1_000
            }
        );
        assert_eq!(report.metrics.peak_memory_bytes, 4_096);
        assert!(report.metrics.execution_time_ms < 2_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breach_at_completion_still_counts() {
        let policy = policy(5_000, 1_000);
        let (run, _) = governed(&policy, |host, _| {
            async move {
                host.allocate(2_000);
                Ok(Value::Null)
            }
            .boxed()
        });
        let report = run.run().await;
        assert_eq!(report.termination.state(), RunState::MemoryExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_swallowed_network_violation_still_terminates() {
        let policy = policy(5_000, 1 << 20);
        let (run, host) = governed(&policy, |host, _| {
            async move {
                let _ = host
                    .fetch(FetchRequest::get("https://evil.example.com/"))
                    .await;
                Ok(json!("pretending all is well"))
            }
            .boxed()
        });
        let report = run.run().await;
        assert_eq!(
            report.termination,
            Termination::NetworkExceeded(NetworkFault::PolicyViolation {
                host: "evil.example.com".to_string()
            })
        );
        assert_eq!(report.violations[0].kind, ViolationKind::Network);

        // The proxy is closed once the run is over.
        let err = host
            .fetch(FetchRequest::get("https://api.example.com/"))
            .await
            .unwrap_err();
        assert_eq!(err, SandboxError::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_outranks_network() {
        let policy = policy(5_000, 1_000);
        let (run, _) = governed(&policy, |host, _| {
            async move {
                let _ = host
                    .fetch(FetchRequest::get("https://evil.example.com/"))
                    .await;
                host.allocate(10_000);
                Ok(Value::Null)
            }
            .boxed()
        });
        let report = run.run().await;
        assert_eq!(report.termination.state(), RunState::MemoryExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_idempotent() {
        let policy = policy(60_000, 1 << 20);
        let (run, _) = governed(&policy, |_, _| {
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }
            .boxed()
        });
        let cancel = run.cancel_handle();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
            canceller.cancel();
        });

        let report = run.run().await;
        assert_eq!(report.termination, Termination::Cancelled);
        assert!(cancel.is_cancelled());
        assert!(report.metrics.execution_time_ms < 1_000);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_error_is_completed_with_error() {
        let policy = policy(1_000, 1 << 20);
        let (run, _) = governed(&policy, |_, _| {
            async move { Err(SandboxError::GuestRuntime("x is undefined".to_string())) }.boxed()
        });
        let report = run.run().await;
        assert_eq!(
            report.termination,
            Termination::Completed(Err(SandboxError::GuestRuntime(
                "x is undefined".to_string()
            )))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_guest_does_not_escape() {
        let policy = policy(1_000, 1 << 20);
        let (run, _) = governed(&policy, |_, _| {
            async move {
                if true {
                    panic!("guest blew up");
                }
                Ok(Value::Null)
            }
            .boxed()
        });
        let report = run.run().await;
        let err = report.termination.into_result().unwrap_err();
        assert_eq!(err.code(), "GuestRuntimeError");
    }
}
