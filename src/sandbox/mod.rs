//! Execution sandbox: the single entry point for running a construct.
//!
//! A run goes through these layers in order, each one able to stop it:
//!
//! 1. Syntax pre-check: unbalanced source never reaches the screener
//! 2. Static screening: dangerous APIs and leaked credentials block the run
//! 3. Policy compilation: every unset limit gets its default
//! 4. Context build: entry point resolution, proxies, no code executed
//! 5. Governed execution: deadline, memory ceiling, network breaches
//!
//! Whatever happens, `execute` returns an `ExecutionResult`.

use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::{ContextBuilder, HttpTransport};
use crate::error::ConfigError;
use crate::governor::{govern, CancelHandle};
use crate::isolation::{IsolationBackend, ProcessBackend};
use crate::policy::compile;
use crate::screener::{is_blocking, Screener};
use crate::source::check_syntax;
use crate::types::{ExecutionRequest, ExecutionResult, VaultBackendKind};
use crate::vault::Vault;

pub struct Sandbox {
    screener: Screener,
    builder: ContextBuilder,
}

impl Sandbox {
    pub fn new(backend: Arc<dyn IsolationBackend>) -> Self {
        Self {
            screener: Screener::new(),
            builder: ContextBuilder::new(backend),
        }
    }

    /// Process backend, screener rules and vault from engine configuration.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ConfigError> {
        let backend = ProcessBackend::from_config(&config.engine);
        let screener = Screener::with_rules(&config.screener.extra_rules)?;
        let mut sandbox = Self::new(Arc::new(backend)).with_screener(screener);

        if let Some(ref vault_config) = config.vault {
            let vault = Vault::from_config(vault_config)?;
            info!(
                backend = vault.backend_name(),
                keys = vault_config.allowed_keys.len(),
                "Credential vault configured"
            );
            sandbox = sandbox.with_vault(vault_config.backend, Arc::new(vault));
        }
        Ok(sandbox)
    }

    pub fn with_screener(mut self, screener: Screener) -> Self {
        self.screener = screener;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.builder = self.builder.with_transport(transport);
        self
    }

    /// Shares `vault` (and its cache) with every run that asks for `kind`.
    pub fn with_vault(mut self, kind: VaultBackendKind, vault: Arc<Vault>) -> Self {
        self.builder = self.builder.with_vault(kind, vault);
        self
    }

    pub fn screener(&self) -> &Screener {
        &self.screener
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        self.execute_with_cancel(request, CancelHandle::new()).await
    }

    /// Like [`execute`](Self::execute); `cancel` stops the run from outside.
    pub async fn execute_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: CancelHandle,
    ) -> ExecutionResult {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sandbox_run",
            %run_id,
            component = %request.component_name,
            backend = self.builder.backend_name()
        );
        self.run(request, cancel).instrument(span).await
    }

    async fn run(&self, request: ExecutionRequest, cancel: CancelHandle) -> ExecutionResult {
        if let Err(e) = check_syntax(&request.source_code) {
            warn!("Rejected source: {e}");
            return ExecutionResult::failed(&e);
        }

        let screened = self.screener.screen(&request.source_code);
        if is_blocking(&screened) {
            warn!(violations = screened.len(), "Execution blocked by screener");
            return ExecutionResult::blocked(screened);
        }

        let policy = compile(&request.security_config);

        let context = match self.builder.build(
            &request.source_code,
            &request.component_name,
            &request.props,
            &policy,
        ) {
            Ok(context) => context,
            Err(e) => {
                warn!("Context build failed: {e}");
                return ExecutionResult::failed(&e).with_violations(screened);
            }
        };

        let report = govern(context, &policy.resource, &policy.monitoring)
            .with_cancel_handle(cancel)
            .run()
            .await;

        // Metrics list every violation; a successful result only carries
        // the screener's informational ones.
        let mut metrics = report.metrics;
        metrics.violations = screened
            .iter()
            .chain(&report.violations)
            .map(|v| v.message.clone())
            .collect();

        match report.termination.into_result() {
            Ok(output) => ExecutionResult::success(output, report.logs, metrics, screened),
            Err(e) => {
                let mut violations = screened;
                violations.extend(report.violations);
                info!(error = e.code(), "Run failed");
                ExecutionResult::failed(&e)
                    .with_logs(report.logs)
                    .with_metrics(metrics)
                    .with_violations(violations)
            }
        }
    }
}
