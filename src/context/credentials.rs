//! Per-run credential access on behalf of guest code.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::error::SandboxError;
use crate::types::{SecurityViolation, Severity, VaultBackendKind, ViolationKind};
use crate::vault::Vault;

use super::ViolationLog;

/// Mediates every secret the guest asks for.
///
/// A key must be allowed by the run's `CredentialPolicy` and by the vault
/// itself. Denials are recorded as `credential` violations and returned to
/// the guest as `CredentialAccessDenied`; they do not terminate the run.
pub struct CredentialBroker {
    backend: VaultBackendKind,
    vault: Option<Arc<Vault>>,
    allowed_keys: BTreeSet<String>,
    violations: Arc<ViolationLog>,
}

impl CredentialBroker {
    pub fn new(
        backend: VaultBackendKind,
        vault: Option<Arc<Vault>>,
        allowed_keys: BTreeSet<String>,
        violations: Arc<ViolationLog>,
    ) -> Self {
        Self {
            backend,
            vault,
            allowed_keys,
            violations,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, SandboxError> {
        if !self.allowed_keys.contains(key) {
            return Err(self.deny(key));
        }

        let Some(vault) = self.vault.as_ref() else {
            debug!(key, backend = self.backend.as_str(), "No vault configured for backend");
            return Ok(None);
        };

        match vault.get_credential(key).await {
            Ok(value) => Ok(value),
            Err(_) => Err(self.deny(key)),
        }
    }

    fn deny(&self, key: &str) -> SandboxError {
        warn!(key, "Guest requested a credential outside its policy");
        let error = SandboxError::CredentialAccessDenied(key.to_string());
        self.violations.push(
            SecurityViolation::new(ViolationKind::Credential, Severity::Medium, error.to_string())
                .with_context(json!({ "key": key })),
        );
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::tests::CountingBackend;
    use std::sync::atomic::Ordering;

    fn keys(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn test_allowed_key_reaches_vault() {
        let backend = Arc::new(CountingBackend::default());
        let vault = Arc::new(Vault::new(backend.clone(), keys(&["API_KEY"])));
        let violations = Arc::new(ViolationLog::default());
        let broker = CredentialBroker::new(
            VaultBackendKind::Local,
            Some(vault),
            keys(&["API_KEY"]),
            violations.clone(),
        );

        assert_eq!(
            broker.get("API_KEY").await.unwrap().as_deref(),
            Some("value-of-API_KEY")
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert!(violations.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_key_outside_run_policy_is_denied_and_recorded() {
        let backend = Arc::new(CountingBackend::default());
        let vault = Arc::new(Vault::new(backend.clone(), keys(&["API_KEY", "DB_URL"])));
        let violations = Arc::new(ViolationLog::default());
        let broker = CredentialBroker::new(
            VaultBackendKind::Local,
            Some(vault),
            keys(&["API_KEY"]),
            violations.clone(),
        );

        let err = broker.get("DB_URL").await.unwrap_err();
        assert_eq!(err, SandboxError::CredentialAccessDenied("DB_URL".to_string()));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        let recorded = violations.snapshot();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].kind, ViolationKind::Credential);
        assert_eq!(recorded[0].severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_vault_denial_is_reported_the_same_way() {
        let vault = Arc::new(Vault::new(Arc::new(CountingBackend::default()), keys(&[])));
        let violations = Arc::new(ViolationLog::default());
        let broker = CredentialBroker::new(
            VaultBackendKind::Local,
            Some(vault),
            keys(&["API_KEY"]),
            violations.clone(),
        );
        assert!(broker.get("API_KEY").await.is_err());
        assert_eq!(violations.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_vault_yields_none() {
        let broker = CredentialBroker::new(
            VaultBackendKind::Hashicorp,
            None,
            keys(&["API_KEY"]),
            Arc::new(ViolationLog::default()),
        );
        assert_eq!(broker.get("API_KEY").await.unwrap(), None);
    }
}
