use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use crate::error::ConfigError;
use crate::screener::RuleConfig;
use crate::types::VaultBackendKind;

/// Engine-wide configuration, loaded once at startup.
///
/// Per-run limits travel with each `ExecutionRequest`; this file only
/// configures the host side (interpreter, screener additions, vault).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: RunnerConfig,
    #[serde(default)]
    pub screener: ScreenerConfig,
    #[serde(default)]
    pub vault: Option<VaultConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Interpreter started once per run by the process backend.
    #[serde(default = "default_program")]
    pub program: String,
    /// Extra interpreter arguments; the source travels on stdin.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory for guest processes.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            workdir: default_workdir(),
        }
    }
}

fn default_program() -> String {
    "node".to_string()
}

fn default_workdir() -> PathBuf {
    std::env::temp_dir()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScreenerConfig {
    #[serde(default)]
    pub extra_rules: Vec<RuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    #[serde(default)]
    pub backend: VaultBackendKind,
    /// Upper bound on the keys any run may read. Empty denies everything.
    #[serde(default)]
    pub allowed_keys: BTreeSet<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub local: LocalVaultConfig,
    pub hashicorp: Option<HashicorpConfig>,
    pub azure: Option<AzureConfig>,
}

fn default_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalVaultConfig {
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    /// Environment variable prefix consulted when a key is not in `secrets`.
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

impl Default for LocalVaultConfig {
    fn default() -> Self {
        Self {
            secrets: HashMap::new(),
            env_prefix: default_env_prefix(),
        }
    }
}

fn default_env_prefix() -> String {
    "CONSTRUCT_SECRET_".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct HashicorpConfig {
    /// e.g. "https://vault.internal:8200"
    pub address: String,
    /// Supports ${ENV_VAR} substitution
    pub token: String,
    #[serde(default = "default_mount")]
    pub mount: String,
    /// Field of the KV v2 secret holding the value.
    #[serde(default = "default_field")]
    pub field: String,
}

fn default_mount() -> String {
    "secret".to_string()
}

fn default_field() -> String {
    "value".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AzureConfig {
    /// e.g. "https://my-vault.vault.azure.net"
    pub vault_url: String,
    /// Supports ${ENV_VAR} substitution
    pub token: String,
}

impl EngineConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        // Expand environment variables like ${VAULT_TOKEN}
        let expanded =
            shellexpand::env(content).map_err(|e| ConfigError::Expand(e.to_string()))?;
        let config: EngineConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(ref vault) = self.vault {
            match vault.backend {
                VaultBackendKind::Hashicorp if vault.hashicorp.is_none() => {
                    return Err(ConfigError::MissingVaultSection {
                        backend: "hashicorp",
                        section: "hashicorp",
                    });
                }
                VaultBackendKind::AzureKeyVault if vault.azure.is_none() => {
                    return Err(ConfigError::MissingVaultSection {
                        backend: "azure-keyvault",
                        section: "azure",
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Human-readable description of the guest runner
    pub fn runner_description(&self) -> String {
        if self.engine.args.is_empty() {
            self.engine.program.clone()
        } else {
            format!("{} {}", self.engine.program, self.engine.args.join(" "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.engine.program, "node");
        assert!(config.engine.args.is_empty());
        assert!(config.screener.extra_rules.is_empty());
        assert!(config.vault.is_none());
    }

    #[test]
    fn test_full_config() {
        let config = EngineConfig::from_toml(
            r#"
            [engine]
            program = "deno"
            args = ["run", "--allow-none", "runner/shim.ts"]

            [[screener.extra_rules]]
            name = "local_storage"
            pattern = "localStorage"
            kind = "code"
            severity = "medium"
            message = "localStorage is not persisted"

            [vault]
            backend = "hashicorp"
            allowed_keys = ["STRIPE_KEY"]
            ttl_secs = 60

            [vault.hashicorp]
            address = "https://vault.internal:8200"
            token = "s.test"
            "#,
        )
        .unwrap();

        assert_eq!(config.runner_description(), "deno run --allow-none runner/shim.ts");
        assert_eq!(config.screener.extra_rules.len(), 1);
        let vault = config.vault.unwrap();
        assert_eq!(vault.backend, VaultBackendKind::Hashicorp);
        assert!(vault.allowed_keys.contains("STRIPE_KEY"));
        assert_eq!(vault.ttl_secs, 60);
        let hashicorp = vault.hashicorp.unwrap();
        assert_eq!(hashicorp.mount, "secret");
        assert_eq!(hashicorp.field, "value");
    }

    #[test]
    fn test_vault_defaults() {
        let config = EngineConfig::from_toml("[vault]\n").unwrap();
        let vault = config.vault.unwrap();
        assert_eq!(vault.backend, VaultBackendKind::Local);
        assert!(vault.allowed_keys.is_empty());
        assert_eq!(vault.ttl_secs, 300);
        assert_eq!(vault.local.env_prefix, "CONSTRUCT_SECRET_");
    }

    #[test]
    fn test_hashicorp_without_section_is_rejected() {
        let result = EngineConfig::from_toml("[vault]\nbackend = \"hashicorp\"\n");
        assert!(matches!(
            result,
            Err(ConfigError::MissingVaultSection { backend: "hashicorp", .. })
        ));
    }

    #[test]
    fn test_azure_without_section_is_rejected() {
        let result = EngineConfig::from_toml("[vault]\nbackend = \"azure-keyvault\"\n");
        assert!(matches!(
            result,
            Err(ConfigError::MissingVaultSection { section: "azure", .. })
        ));
    }

    #[test]
    fn test_env_vars_are_expanded() {
        std::env::set_var("CONSTRUCT_SANDBOX_TEST_TOKEN", "expanded-token");
        let config = EngineConfig::from_toml(
            r#"
            [vault]
            backend = "azure-keyvault"
            [vault.azure]
            vault_url = "https://example.vault.azure.net"
            token = "${CONSTRUCT_SANDBOX_TEST_TOKEN}"
            "#,
        )
        .unwrap();
        assert_eq!(config.vault.unwrap().azure.unwrap().token, "expanded-token");
    }

    #[test]
    fn test_undefined_env_var_is_error() {
        let result = EngineConfig::from_toml("[engine]\nprogram = \"${CONSTRUCT_SANDBOX_UNSET_VAR}\"\n");
        assert!(matches!(result, Err(ConfigError::Expand(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nprogram = \"python3\"").unwrap();
        let config = EngineConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.engine.program, "python3");
    }

    #[test]
    fn test_example_config_parses() {
        let config =
            EngineConfig::from_toml(include_str!("../config/sandbox.example.toml")).unwrap();
        assert_eq!(config.runner_description(), "node runner.mjs");
        assert_eq!(config.screener.extra_rules.len(), 1);
        let vault = config.vault.unwrap();
        assert_eq!(vault.backend, VaultBackendKind::Local);
        assert!(vault.allowed_keys.contains("MAPS_API_KEY"));
        assert!(vault.local.secrets.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let result = EngineConfig::load("/nonexistent/sandbox.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
