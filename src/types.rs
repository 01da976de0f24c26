//! Request, violation and result types exchanged with the caller.
//!
//! These mirror the JSON the hosting platform sends and renders, so every
//! type serializes in camelCase.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SandboxError;

// ── Request ──────────────────────────────────────────────

/// One submitted construct run. Immutable once handed to the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub source_code: String,
    pub component_name: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default)]
    pub security_config: SecurityConfig,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>, component_name: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            component_name: component_name.into(),
            props: Map::new(),
            security_config: SecurityConfig::default(),
        }
    }

    pub fn with_props(mut self, props: Map<String, Value>) -> Self {
        self.props = props;
        self
    }

    pub fn with_security_config(mut self, config: SecurityConfig) -> Self {
        self.security_config = config;
        self
    }
}

/// Declarative security configuration. Every field is optional; the
/// policy compiler fills the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SecurityConfig {
    pub resource_limits: ResourceLimits,
    pub network: NetworkLimits,
    pub credentials: CredentialPolicy,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    pub cpu_cores: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub max_memory_bytes: Option<u64>,
    pub execution_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkLimits {
    pub allowed_hosts: BTreeSet<String>,
    /// `None` lets the compiler decide from `allowed_hosts`.
    pub block_all_network: Option<bool>,
    pub max_requests: Option<u32>,
    pub max_bandwidth_bytes_per_sec: Option<u64>,
}

/// Secret storage backends a run may draw credentials from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VaultBackendKind {
    #[default]
    Local,
    AwsSecrets,
    #[serde(rename = "azure-keyvault")]
    AzureKeyVault,
    Hashicorp,
}

impl VaultBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::AwsSecrets => "aws-secrets",
            Self::AzureKeyVault => "azure-keyvault",
            Self::Hashicorp => "hashicorp",
        }
    }
}

/// An empty `allowed_keys` set denies every credential.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialPolicy {
    pub vault_backend: VaultBackendKind,
    pub allowed_keys: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringConfig {
    pub memory_sample_interval_ms: Option<u64>,
    pub max_log_lines: Option<usize>,
}

// ── Violations ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Code,
    Network,
    Resource,
    Credential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and critical findings prevent or fail a run.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityViolation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl SecurityViolation {
    pub fn new(kind: ViolationKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            message: message.into(),
            detected_at: Utc::now(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}

// ── Results ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A line the guest wrote to its console.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxMetrics {
    pub execution_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub cpu_time_ms: u64,
    pub network_request_count: u32,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub outcome: Outcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default)]
    pub logs: Vec<LogLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SandboxMetrics>,
    #[serde(default)]
    pub violations: Vec<SecurityViolation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(
        output: Value,
        logs: Vec<LogLine>,
        metrics: SandboxMetrics,
        violations: Vec<SecurityViolation>,
    ) -> Self {
        Self {
            outcome: Outcome::Success,
            output: Some(output),
            logs,
            metrics: Some(metrics),
            violations,
            error: None,
        }
    }

    /// Screening stopped the run before anything was compiled or executed.
    pub fn blocked(violations: Vec<SecurityViolation>) -> Self {
        let count = violations
            .iter()
            .filter(|v| v.severity.is_blocking())
            .count();
        Self {
            outcome: Outcome::Blocked,
            output: None,
            logs: Vec::new(),
            metrics: None,
            violations,
            error: Some(SandboxError::SecurityViolationBlocked { count }.to_string()),
        }
    }

    pub fn failed(error: &SandboxError) -> Self {
        Self {
            outcome: Outcome::Failed,
            output: None,
            logs: Vec::new(),
            metrics: None,
            violations: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn with_logs(mut self, logs: Vec<LogLine>) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_metrics(mut self, metrics: SandboxMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_violations(mut self, violations: Vec<SecurityViolation>) -> Self {
        self.violations = violations;
        self
    }

    /// Taxonomy code of the error, if any (`"ExecutionTimeout"`, ...).
    pub fn error_code(&self) -> Option<&str> {
        self.error
            .as_deref()
            .map(|e| e.split(':').next().unwrap_or(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_deserializes_from_camel_case() {
        let request: ExecutionRequest = serde_json::from_value(json!({
            "sourceCode": "export const C = () => 1",
            "componentName": "C",
            "props": {"title": "hi"},
            "securityConfig": {
                "resourceLimits": {"executionTimeoutMs": 10},
                "network": {"allowedHosts": ["api.example.com"], "maxRequests": 3},
                "credentials": {"vaultBackend": "azure-keyvault", "allowedKeys": ["DB"]}
            }
        }))
        .unwrap();

        assert_eq!(request.component_name, "C");
        assert_eq!(request.props["title"], "hi");
        let config = &request.security_config;
        assert_eq!(config.resource_limits.execution_timeout_ms, Some(10));
        assert!(config.network.allowed_hosts.contains("api.example.com"));
        assert_eq!(config.network.max_requests, Some(3));
        assert_eq!(config.network.block_all_network, None);
        assert_eq!(config.credentials.vault_backend, VaultBackendKind::AzureKeyVault);
    }

    #[test]
    fn test_request_minimal_payload_uses_defaults() {
        let request: ExecutionRequest = serde_json::from_value(json!({
            "sourceCode": "",
            "componentName": "C"
        }))
        .unwrap();
        assert!(request.props.is_empty());
        assert!(request.security_config.credentials.allowed_keys.is_empty());
        assert_eq!(
            request.security_config.credentials.vault_backend,
            VaultBackendKind::Local
        );
    }

    #[test]
    fn test_vault_backend_names() {
        for kind in [
            VaultBackendKind::Local,
            VaultBackendKind::AwsSecrets,
            VaultBackendKind::AzureKeyVault,
            VaultBackendKind::Hashicorp,
        ] {
            let encoded = serde_json::to_value(kind).unwrap();
            assert_eq!(encoded, json!(kind.as_str()));
        }
    }

    #[test]
    fn test_severity_ordering_and_blocking() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(!Severity::Low.is_blocking());
        assert!(!Severity::Medium.is_blocking());
        assert!(Severity::High.is_blocking());
        assert!(Severity::Critical.is_blocking());
    }

    #[test]
    fn test_blocked_result_counts_blocking_violations() {
        let result = ExecutionResult::blocked(vec![
            SecurityViolation::new(ViolationKind::Code, Severity::High, "eval() is not allowed"),
            SecurityViolation::new(ViolationKind::Code, Severity::Low, "console usage"),
        ]);
        assert_eq!(result.outcome, Outcome::Blocked);
        assert_eq!(result.error_code(), Some("SecurityViolationBlocked"));
        assert!(result.error.unwrap().contains("1 blocking"));
        assert!(result.metrics.is_none());
    }

    #[test]
    fn test_result_serializes_outcome_lowercase() {
        let result = ExecutionResult::failed(&SandboxError::ExecutionTimeout { limit_ms: 10 });
        let encoded = serde_json::to_value(&result).unwrap();
        assert_eq!(encoded["outcome"], "failed");
        assert_eq!(encoded["error"], "ExecutionTimeout");
        assert!(encoded.get("output").is_none());
    }
}
