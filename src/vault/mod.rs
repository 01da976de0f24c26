//! Credential vault: pluggable secret retrieval with caching and key
//! allow-listing.
//!
//! Supported backends:
//! - **local**: config table, then environment variables
//! - **hashicorp**: HashiCorp Vault KV v2 over HTTP
//! - **azure-keyvault**: Azure Key Vault secrets REST API
//! - **aws-secrets**: declared but not implemented; always unavailable
//!
//! Each `Vault` owns its cache. Nothing is shared between vault instances,
//! so unrelated configurations never see each other's secrets.

mod aws;
mod azure;
mod hashicorp;
mod local;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::VaultConfig;
use crate::error::{ConfigError, VaultError};
use crate::types::VaultBackendKind;

pub use aws::AwsSecretsBackend;
pub use azure::AzureKeyVaultBackend;
pub use hashicorp::HashicorpBackend;
pub use local::LocalBackend;

/// How long a fetched secret stays cached (5 minutes).
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Outcome of asking a backend for a key.
#[derive(Clone, PartialEq)]
pub enum SecretLookup {
    Found(String),
    NotFound,
    /// The backend cannot answer (not implemented, unreachable, ...).
    Unavailable(String),
}

impl fmt::Debug for SecretLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Found(_) => f.write_str("Found(<redacted>)"),
            Self::NotFound => f.write_str("NotFound"),
            Self::Unavailable(reason) => f.debug_tuple("Unavailable").field(reason).finish(),
        }
    }
}

// ── VaultBackend trait ───────────────────────────────────

/// Abstraction over secret storage services.
///
/// Backend-specific auth lives in the backend's own configuration.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    /// Fetches the current value of `key`.
    async fn fetch(&self, key: &str) -> anyhow::Result<SecretLookup>;

    /// The backend name (e.g. `"hashicorp"`).
    fn backend_name(&self) -> &str;
}

/// Builds the backend selected by `config.backend`.
pub fn backend_from_config(config: &VaultConfig) -> Result<Arc<dyn VaultBackend>, ConfigError> {
    let backend: Arc<dyn VaultBackend> = match config.backend {
        VaultBackendKind::Local => Arc::new(LocalBackend::new(&config.local)),
        VaultBackendKind::Hashicorp => {
            let hc = config
                .hashicorp
                .as_ref()
                .ok_or(ConfigError::MissingVaultSection {
                    backend: "hashicorp",
                    section: "hashicorp",
                })?;
            Arc::new(HashicorpBackend::new(hc))
        }
        VaultBackendKind::AzureKeyVault => {
            let azure = config
                .azure
                .as_ref()
                .ok_or(ConfigError::MissingVaultSection {
                    backend: "azure-keyvault",
                    section: "azure",
                })?;
            Arc::new(AzureKeyVaultBackend::new(azure))
        }
        VaultBackendKind::AwsSecrets => Arc::new(AwsSecretsBackend),
    };
    Ok(backend)
}

// ── Vault ────────────────────────────────────────────────

/// A cached secret.
pub struct VaultEntry {
    pub key: String,
    pub cached_value: String,
    pub expires_at: Instant,
}

impl fmt::Debug for VaultEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultEntry")
            .field("key", &self.key)
            .field("cached_value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub struct Vault {
    backend: Arc<dyn VaultBackend>,
    allowed_keys: BTreeSet<String>,
    ttl: Duration,
    cache: RwLock<HashMap<String, VaultEntry>>,
}

impl Vault {
    /// An empty `allowed_keys` set denies every key.
    pub fn new(backend: Arc<dyn VaultBackend>, allowed_keys: BTreeSet<String>) -> Self {
        Self {
            backend,
            allowed_keys,
            ttl: DEFAULT_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn from_config(config: &VaultConfig) -> Result<Self, ConfigError> {
        let backend = backend_from_config(config)?;
        Ok(Self::new(backend, config.allowed_keys.clone())
            .with_ttl(Duration::from_secs(config.ttl_secs)))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.backend_name()
    }

    pub fn is_allowed(&self, key: &str) -> bool {
        self.allowed_keys.contains(key)
    }

    /// Returns the secret for `key`, or `None` when the backend has no
    /// value or cannot answer.
    pub async fn get_credential(&self, key: &str) -> Result<Option<String>, VaultError> {
        match self.lookup(key).await? {
            SecretLookup::Found(value) => Ok(Some(value)),
            SecretLookup::NotFound | SecretLookup::Unavailable(_) => Ok(None),
        }
    }

    /// Like [`get_credential`](Self::get_credential) but keeps "not found"
    /// and "unavailable" apart.
    pub async fn lookup(&self, key: &str) -> Result<SecretLookup, VaultError> {
        if !self.is_allowed(key) {
            warn!(key, "Credential access denied");
            return Err(VaultError::AccessDenied(key.to_string()));
        }

        if let Some(entry) = self.cache.read().await.get(key) {
            if Instant::now() < entry.expires_at {
                debug!(key, "Credential served from cache");
                return Ok(SecretLookup::Found(entry.cached_value.clone()));
            }
        }

        let lookup = match self.backend.fetch(key).await {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(key, backend = self.backend.backend_name(), "Vault backend failed: {e}");
                SecretLookup::Unavailable(e.to_string())
            }
        };

        match lookup {
            SecretLookup::Found(ref value) => {
                self.cache.write().await.insert(
                    key.to_string(),
                    VaultEntry {
                        key: key.to_string(),
                        cached_value: value.clone(),
                        expires_at: Instant::now() + self.ttl,
                    },
                );
            }
            SecretLookup::NotFound => debug!(key, "Credential not found"),
            SecretLookup::Unavailable(ref reason) => {
                debug!(key, reason = %reason, "Credential unavailable")
            }
        }
        Ok(lookup)
    }

    /// Drops the cached value for `key`, if any.
    pub async fn delete_credential(&self, key: &str) {
        if self.cache.write().await.remove(key).is_some() {
            debug!(key, "Credential evicted from cache");
        }
    }

    /// Drops every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| now < entry.expires_at);
        before - cache.len()
    }

    #[cfg(test)]
    pub(crate) async fn cached_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend returning `"value-of-<key>"` for every key except `"MISSING"`.
    #[derive(Default)]
    pub(crate) struct CountingBackend {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl VaultBackend for CountingBackend {
        async fn fetch(&self, key: &str) -> anyhow::Result<SecretLookup> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if key == "MISSING" {
                return Ok(SecretLookup::NotFound);
            }
            Ok(SecretLookup::Found(format!("value-of-{key}")))
        }

        fn backend_name(&self) -> &str {
            "counting"
        }
    }

    struct BrokenBackend;

    #[async_trait]
    impl VaultBackend for BrokenBackend {
        async fn fetch(&self, _key: &str) -> anyhow::Result<SecretLookup> {
            anyhow::bail!("connection reset")
        }

        fn backend_name(&self) -> &str {
            "broken"
        }
    }

    fn keys(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn counting_vault(allowed: &[&str]) -> (Vault, Arc<CountingBackend>) {
        let backend = Arc::new(CountingBackend::default());
        (Vault::new(backend.clone(), keys(allowed)), backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hits_backend_once_within_ttl() {
        let (vault, backend) = counting_vault(&["X"]);

        assert_eq!(vault.get_credential("X").await.unwrap().as_deref(), Some("value-of-X"));
        assert_eq!(vault.get_credential("X").await.unwrap().as_deref(), Some("value-of-X"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;

        assert_eq!(vault.get_credential("X").await.unwrap().as_deref(), Some("value-of-X"));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_still_valid_just_before_ttl() {
        let (vault, backend) = counting_vault(&["X"]);
        vault.get_credential("X").await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        vault.get_credential("X").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_outside_allow_list_is_denied_without_backend_call() {
        let (vault, backend) = counting_vault(&["X"]);
        let err = vault.get_credential("Y").await.unwrap_err();
        assert_eq!(err, VaultError::AccessDenied("Y".to_string()));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(vault.cached_len().await, 0);
    }

    #[tokio::test]
    async fn test_empty_allow_list_denies_everything() {
        let (vault, backend) = counting_vault(&[]);
        assert!(vault.get_credential("X").await.is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_found_is_none_and_not_cached() {
        let (vault, backend) = counting_vault(&["MISSING"]);
        assert_eq!(vault.get_credential("MISSING").await.unwrap(), None);
        assert_eq!(vault.get_credential("MISSING").await.unwrap(), None);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(vault.cached_len().await, 0);
    }

    #[tokio::test]
    async fn test_backend_failure_resolves_to_none() {
        let vault = Vault::new(Arc::new(BrokenBackend), keys(&["X"]));
        assert_eq!(vault.get_credential("X").await.unwrap(), None);
        match vault.lookup("X").await.unwrap() {
            SecretLookup::Unavailable(reason) => assert!(reason.contains("connection reset")),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_forces_refetch() {
        let (vault, backend) = counting_vault(&["X"]);
        vault.get_credential("X").await.unwrap();
        vault.delete_credential("X").await;
        vault.delete_credential("X").await;
        vault.get_credential("X").await.unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let (vault, _) = counting_vault(&["A", "B"]);
        vault.get_credential("A").await.unwrap();
        tokio::time::advance(Duration::from_secs(200)).await;
        vault.get_credential("B").await.unwrap();
        tokio::time::advance(Duration::from_secs(150)).await;
        assert_eq!(vault.purge_expired().await, 1);
        assert_eq!(vault.cached_len().await, 1);
    }

    #[tokio::test]
    async fn test_vault_instances_do_not_share_cache() {
        let (first, _) = counting_vault(&["X"]);
        let (second, second_backend) = counting_vault(&["X"]);
        first.get_credential("X").await.unwrap();
        second.get_credential("X").await.unwrap();
        assert_eq!(second_backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_readers_share_one_entry() {
        let (vault, _) = counting_vault(&["X"]);
        let vault = Arc::new(vault);
        vault.get_credential("X").await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let vault = vault.clone();
            handles.push(tokio::spawn(async move { vault.get_credential("X").await }));
        }
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap().as_deref(),
                Some("value-of-X")
            );
        }
        assert_eq!(vault.cached_len().await, 1);
    }

    #[test]
    fn test_debug_output_redacts_values() {
        let lookup = SecretLookup::Found("super-secret".to_string());
        assert!(!format!("{lookup:?}").contains("super-secret"));
        let entry = VaultEntry {
            key: "X".to_string(),
            cached_value: "super-secret".to_string(),
            expires_at: Instant::now(),
        };
        assert!(!format!("{entry:?}").contains("super-secret"));
    }

    #[test]
    fn test_backend_from_config_selects_backend() {
        let config = crate::config::EngineConfig::from_toml("[vault]\nbackend = \"aws-secrets\"\n")
            .unwrap()
            .vault
            .unwrap();
        let backend = backend_from_config(&config).unwrap();
        assert_eq!(backend.backend_name(), "aws-secrets");
    }
}
