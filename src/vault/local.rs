//! Local backend: secrets from the engine config, then the environment.

use std::collections::HashMap;

use async_trait::async_trait;

use super::{SecretLookup, VaultBackend};
use crate::config::LocalVaultConfig;

pub struct LocalBackend {
    secrets: HashMap<String, String>,
    env_prefix: String,
}

impl LocalBackend {
    pub fn new(config: &LocalVaultConfig) -> Self {
        Self {
            secrets: config.secrets.clone(),
            env_prefix: config.env_prefix.clone(),
        }
    }

    /// `stripe.key` → `CONSTRUCT_SECRET_STRIPE_KEY`
    fn env_name(&self, key: &str) -> String {
        let suffix: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{suffix}", self.env_prefix)
    }
}

#[async_trait]
impl VaultBackend for LocalBackend {
    async fn fetch(&self, key: &str) -> anyhow::Result<SecretLookup> {
        if let Some(value) = self.secrets.get(key) {
            return Ok(SecretLookup::Found(value.clone()));
        }
        match std::env::var(self.env_name(key)) {
            Ok(value) => Ok(SecretLookup::Found(value)),
            Err(_) => Ok(SecretLookup::NotFound),
        }
    }

    fn backend_name(&self) -> &str {
        "local"
    }
}
