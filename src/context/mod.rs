//! Isolated execution contexts.
//!
//! A context bundles everything one run may touch: the resolved entry point,
//! the declared props, a network proxy, a credential broker and the
//! bookkeeping the governor reads (memory gauge, logs, violations). Guests
//! only ever see a [`GuestHost`] handle, which has no method for the
//! capabilities a UI component does not need.

pub mod credentials;
pub mod network;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SandboxError;
use crate::isolation::{GuestEntry, IsolationBackend};
use crate::policy::CompiledPolicy;
use crate::types::{LogLevel, LogLine, SecurityViolation, VaultBackendKind};
use crate::vault::Vault;

pub use credentials::CredentialBroker;
pub use network::{
    FetchRequest, FetchResponse, HttpTransport, NetworkFault, NetworkProxy, ReqwestTransport,
};

// ── Run bookkeeping ──────────────────────────────────────

/// Append-only list of violations raised while a run is in progress.
#[derive(Debug, Default)]
pub struct ViolationLog {
    entries: Mutex<Vec<SecurityViolation>>,
}

impl ViolationLog {
    pub fn push(&self, violation: SecurityViolation) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(violation);
        }
    }

    pub fn snapshot(&self) -> Vec<SecurityViolation> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Longest log message kept; the rest is cut off with a marker.
pub const MAX_LOG_MESSAGE_BYTES: usize = 8 * 1024;

/// Guest console output, capped at `max_lines` of at most
/// [`MAX_LOG_MESSAGE_BYTES`] each.
#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<Vec<LogLine>>,
    max_lines: usize,
    dropped: AtomicU64,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: Mutex::new(Vec::new()),
            max_lines,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, level: LogLevel, message: impl Into<String>) {
        let message = truncate_message(message.into());
        debug!(level = ?level, "guest: {message}");
        let Ok(mut lines) = self.lines.lock() else {
            return;
        };
        if lines.len() < self.max_lines {
            lines.push(LogLine {
                level,
                message,
                at: Utc::now(),
            });
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Retained lines, followed by a marker line when some were dropped.
    pub fn snapshot(&self) -> Vec<LogLine> {
        let mut lines = self
            .lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default();
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            lines.push(LogLine {
                level: LogLevel::Warn,
                message: format!("{dropped} log line(s) dropped"),
                at: Utc::now(),
            });
        }
        lines
    }
}

fn truncate_message(mut message: String) -> String {
    if message.len() <= MAX_LOG_MESSAGE_BYTES {
        return message;
    }
    let total = message.len();
    let mut end = MAX_LOG_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
    message.push_str(&format!(" [truncated {} bytes]", total - end));
    message
}

/// USER_HZ on Linux.
const CLOCK_TICKS_PER_SEC: u64 = 100;

const PAGE_SIZE: u64 = 4096;

/// Memory and CPU usage of a run.
///
/// In-process guests report allocations through [`GuestHost::allocate`].
/// Process guests register their pid and are measured from `/proc`.
#[derive(Debug, Default)]
pub struct ResourceGauge {
    reported: AtomicU64,
    pid: AtomicU32,
    peak: AtomicU64,
    cpu_ms: Mutex<Option<u64>>,
}

impl ResourceGauge {
    /// Returns the new reported total.
    pub fn allocate(&self, bytes: u64) -> u64 {
        self.reported.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid, Ordering::SeqCst);
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Current usage in bytes. Also records the peak and the CPU time.
    pub fn sample(&self) -> u64 {
        let current = match self.pid() {
            Some(pid) => {
                if let Some(ms) = read_cpu_ms(pid) {
                    if let Ok(mut cpu) = self.cpu_ms.lock() {
                        *cpu = Some(ms);
                    }
                }
                read_rss_bytes(pid).unwrap_or_else(|| self.reported.load(Ordering::SeqCst))
            }
            None => self.reported.load(Ordering::SeqCst),
        };
        self.peak.fetch_max(current, Ordering::SeqCst);
        current
    }

    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::SeqCst)
    }

    /// CPU time observed for a process guest, if any was measured.
    pub fn cpu_time(&self) -> Option<Duration> {
        self.cpu_ms
            .lock()
            .ok()
            .and_then(|cpu| *cpu)
            .map(Duration::from_millis)
    }
}

fn read_rss_bytes(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(pages * PAGE_SIZE)
}

fn read_cpu_ms(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_cpu_ms(&stat)
}

/// utime + stime from a `/proc/<pid>/stat` line, in milliseconds.
fn parse_cpu_ms(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields resume after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * 1000 / CLOCK_TICKS_PER_SEC)
}

// ── Capabilities ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Props,
    Log,
    Fetch,
    Credentials,
    Memory,
    Socket,
    Websocket,
    Worker,
    Subprocess,
    Filesystem,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Props => "props",
            Self::Log => "log",
            Self::Fetch => "fetch",
            Self::Credentials => "credentials",
            Self::Memory => "memory",
            Self::Socket => "socket",
            Self::Websocket => "websocket",
            Self::Worker => "worker",
            Self::Subprocess => "subprocess",
            Self::Filesystem => "filesystem",
        }
    }
}

/// Capabilities that are never part of a component context.
pub const REMOVED_CAPABILITIES: [Capability; 5] = [
    Capability::Socket,
    Capability::Websocket,
    Capability::Worker,
    Capability::Subprocess,
    Capability::Filesystem,
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Capabilities {
    granted: BTreeSet<Capability>,
}

impl Capabilities {
    /// What a UI component gets: props, console, proxied fetch,
    /// credentials and memory accounting.
    pub fn for_components() -> Self {
        Self {
            granted: [
                Capability::Props,
                Capability::Log,
                Capability::Fetch,
                Capability::Credentials,
                Capability::Memory,
            ]
            .into_iter()
            .collect(),
        }
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.granted.iter().map(Capability::as_str).collect()
    }
}

// ── Guest host handle ────────────────────────────────────

/// The only handle guest code gets on the outside world.
#[derive(Clone)]
pub struct GuestHost {
    props: Arc<Value>,
    capabilities: Arc<Capabilities>,
    network: Arc<NetworkProxy>,
    credentials: Arc<CredentialBroker>,
    gauge: Arc<ResourceGauge>,
    logs: Arc<LogBuffer>,
    violations: Arc<ViolationLog>,
}

impl GuestHost {
    pub fn props(&self) -> &Value {
        &self.props
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn capability_names(&self) -> Vec<&'static str> {
        self.capabilities.names()
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, SandboxError> {
        self.network.fetch(request).await
    }

    pub async fn credential(&self, key: &str) -> Result<Option<String>, SandboxError> {
        self.credentials.get(key).await
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(level, message);
    }

    /// Accounts `bytes` against the run's memory ceiling.
    pub fn allocate(&self, bytes: u64) -> u64 {
        self.gauge.allocate(bytes)
    }

    /// Adds a violation to the run's report.
    pub fn record_violation(&self, violation: SecurityViolation) {
        self.violations.push(violation);
    }

    /// Lets process backends hand their child over to `/proc` sampling.
    pub fn set_pid(&self, pid: u32) {
        self.gauge.set_pid(pid);
    }
}

// ── IsolatedContext ──────────────────────────────────────

/// A fully built, not yet started run.
pub struct IsolatedContext {
    pub(crate) component_name: String,
    pub(crate) entry: Arc<dyn GuestEntry>,
    pub(crate) props: Value,
    pub(crate) capabilities: Arc<Capabilities>,
    pub(crate) network: Arc<NetworkProxy>,
    pub(crate) credentials: Arc<CredentialBroker>,
    pub(crate) gauge: Arc<ResourceGauge>,
    pub(crate) logs: Arc<LogBuffer>,
    pub(crate) violations: Arc<ViolationLog>,
    pub(crate) faults: mpsc::UnboundedReceiver<NetworkFault>,
}

impl IsolatedContext {
    pub fn component_name(&self) -> &str {
        &self.component_name
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn network(&self) -> &NetworkProxy {
        &self.network
    }

    pub fn host(&self) -> GuestHost {
        GuestHost {
            props: Arc::new(self.props.clone()),
            capabilities: self.capabilities.clone(),
            network: self.network.clone(),
            credentials: self.credentials.clone(),
            gauge: self.gauge.clone(),
            logs: self.logs.clone(),
            violations: self.violations.clone(),
        }
    }
}

// ── ContextBuilder ───────────────────────────────────────

/// Turns compiled policies into isolated contexts.
pub struct ContextBuilder {
    backend: Arc<dyn IsolationBackend>,
    transport: Arc<dyn HttpTransport>,
    vaults: HashMap<VaultBackendKind, Arc<Vault>>,
}

impl ContextBuilder {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            backend,
            transport: Arc::new(ReqwestTransport::new()),
            vaults: HashMap::new(),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = transport;
        self
    }

    /// Registers the vault serving runs that ask for `kind`.
    pub fn with_vault(mut self, kind: VaultBackendKind, vault: Arc<Vault>) -> Self {
        self.vaults.insert(kind, vault);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Resolves the entry point and wires the run's proxies. Never executes
    /// guest code.
    pub fn build(
        &self,
        code: &str,
        component_name: &str,
        props: &Map<String, Value>,
        policy: &CompiledPolicy,
    ) -> Result<IsolatedContext, SandboxError> {
        let entry = self.backend.resolve_entry(code, component_name)?;

        let violations = Arc::new(ViolationLog::default());
        let (network, faults) = NetworkProxy::new(
            policy.network.clone(),
            self.transport.clone(),
            violations.clone(),
        );
        let credentials = CredentialBroker::new(
            policy.credentials.vault_backend,
            self.vaults.get(&policy.credentials.vault_backend).cloned(),
            policy.credentials.allowed_keys.clone(),
            violations.clone(),
        );

        debug!(
            component = component_name,
            backend = self.backend.name(),
            "Built isolated context"
        );

        Ok(IsolatedContext {
            component_name: component_name.to_string(),
            entry,
            props: Value::Object(props.clone()),
            capabilities: Arc::new(Capabilities::for_components()),
            network: Arc::new(network),
            credentials: Arc::new(credentials),
            gauge: Arc::new(ResourceGauge::default()),
            logs: Arc::new(LogBuffer::new(policy.monitoring.max_log_lines)),
            violations,
            faults,
        })
    }
}
