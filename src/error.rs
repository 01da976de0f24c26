//! Error taxonomy for sandboxed construct execution.
//!
//! Every variant is translated into a structured `ExecutionResult` by the
//! orchestrator; none of them escapes `Sandbox::execute()`. The `Display`
//! form always starts with the taxonomy name (see [`SandboxError::code`]) so
//! renderers can branch on the prefix.

use thiserror::Error;

/// Failures a sandbox run can end with.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxError {
    /// The submitted source could not be parsed (unbalanced delimiters,
    /// unterminated strings or comments).
    #[error("SyntaxError: {message} (line {line}, column {column})")]
    Syntax {
        message: String,
        line: usize,
        column: usize,
    },

    /// The screener found at least one high or critical violation.
    #[error("SecurityViolationBlocked: {count} blocking violation(s) found")]
    SecurityViolationBlocked { count: usize },

    /// The component name does not resolve to a callable entry point.
    #[error("InvalidEntryPoint: {0}")]
    InvalidEntryPoint(String),

    #[error("ExecutionTimeout")]
    ExecutionTimeout { limit_ms: u64 },

    #[error("MemoryLimitExceeded: {used} bytes exceeds the limit of {limit} bytes")]
    MemoryLimitExceeded { used: u64, limit: u64 },

    /// A single line of guest output was larger than the host will buffer.
    #[error("OutputLimitExceeded: guest output line exceeds {limit} bytes")]
    OutputLimitExceeded { limit: usize },

    #[error("NetworkPolicyViolation: {0}")]
    NetworkPolicyViolation(String),

    #[error("NetworkQuotaExceeded: limit of {limit} requests reached")]
    NetworkQuotaExceeded { limit: u32 },

    #[error("CredentialAccessDenied: key '{0}' is not in the allowed set")]
    CredentialAccessDenied(String),

    /// The guest code failed during normal execution.
    #[error("GuestRuntimeError: {0}")]
    GuestRuntime(String),

    /// The run was cancelled by the caller.
    #[error("ExecutionCancelled")]
    Cancelled,

    /// The isolation backend could not start or talk to the guest.
    #[error("BackendFailure: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Taxonomy name of the error, e.g. `"ExecutionTimeout"`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Syntax { .. } => "SyntaxError",
            Self::SecurityViolationBlocked { .. } => "SecurityViolationBlocked",
            Self::InvalidEntryPoint(_) => "InvalidEntryPoint",
            Self::ExecutionTimeout { .. } => "ExecutionTimeout",
            Self::MemoryLimitExceeded { .. } => "MemoryLimitExceeded",
            Self::OutputLimitExceeded { .. } => "OutputLimitExceeded",
            Self::NetworkPolicyViolation(_) => "NetworkPolicyViolation",
            Self::NetworkQuotaExceeded { .. } => "NetworkQuotaExceeded",
            Self::CredentialAccessDenied(_) => "CredentialAccessDenied",
            Self::GuestRuntime(_) => "GuestRuntimeError",
            Self::Cancelled => "ExecutionCancelled",
            Self::Backend(_) => "BackendFailure",
        }
    }
}

/// Errors returned by the credential vault.
///
/// Backend failures never surface here; they resolve to `None`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VaultError {
    #[error("CredentialAccessDenied: key '{0}' is not in the allowed set")]
    AccessDenied(String),
}

impl From<VaultError> for SandboxError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::AccessDenied(key) => SandboxError::CredentialAccessDenied(key),
        }
    }
}

/// Errors raised while loading or validating engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot expand environment variables: {0}")]
    Expand(String),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid screener rule '{name}': {source}")]
    InvalidRule {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("vault backend '{backend}' requires the [vault.{section}] section")]
    MissingVaultSection {
        backend: &'static str,
        section: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_is_bare_code() {
        let err = SandboxError::ExecutionTimeout { limit_ms: 10 };
        assert_eq!(err.to_string(), "ExecutionTimeout");
        assert_eq!(err.code(), "ExecutionTimeout");
    }

    #[test]
    fn test_display_starts_with_code() {
        let errors = vec![
            SandboxError::Syntax {
                message: "unexpected ')'".to_string(),
                line: 1,
                column: 4,
            },
            SandboxError::SecurityViolationBlocked { count: 2 },
            SandboxError::InvalidEntryPoint("C".to_string()),
            SandboxError::MemoryLimitExceeded { used: 2, limit: 1 },
            SandboxError::OutputLimitExceeded { limit: 1024 },
            SandboxError::NetworkPolicyViolation("evil.example.com".to_string()),
            SandboxError::NetworkQuotaExceeded { limit: 10 },
            SandboxError::CredentialAccessDenied("DB".to_string()),
            SandboxError::GuestRuntime("boom".to_string()),
            SandboxError::Cancelled,
            SandboxError::Backend("spawn failed".to_string()),
        ];
        for err in errors {
            assert!(
                err.to_string().starts_with(err.code()),
                "{err} should start with {}",
                err.code()
            );
        }
    }

    #[test]
    fn test_vault_error_converts_to_access_denied() {
        let err: SandboxError = VaultError::AccessDenied("API_KEY".to_string()).into();
        assert_eq!(err, SandboxError::CredentialAccessDenied("API_KEY".to_string()));
    }
}
