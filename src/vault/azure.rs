//! Azure Key Vault backend.
//!
//! Calls `GET {vault_url}/secrets/{name}?api-version=7.4` with a bearer
//! token. Token acquisition (managed identity, service principal) happens
//! outside the engine and is passed in through configuration.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{SecretLookup, VaultBackend};
use crate::config::AzureConfig;

const API_VERSION: &str = "7.4";

#[derive(Deserialize)]
pub(super) struct AzureSecretBundle {
    pub value: Option<String>,
}

pub struct AzureKeyVaultBackend {
    client: Client,
    vault_url: String,
    token: String,
}

impl AzureKeyVaultBackend {
    pub fn new(config: &AzureConfig) -> Self {
        Self {
            client: Client::new(),
            vault_url: config.vault_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }

    /// Key Vault secret names only allow alphanumerics and dashes.
    fn secret_name(key: &str) -> String {
        key.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    }

    fn secret_url(&self, key: &str) -> String {
        format!(
            "{}/secrets/{}?api-version={API_VERSION}",
            self.vault_url,
            Self::secret_name(key)
        )
    }
}

#[async_trait]
impl VaultBackend for AzureKeyVaultBackend {
    async fn fetch(&self, key: &str) -> anyhow::Result<SecretLookup> {
        let response = self
            .client
            .get(self.secret_url(key))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SecretLookup::NotFound);
        }
        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("Azure Key Vault returned {status}");
        }

        let bundle: AzureSecretBundle = response.json().await?;
        Ok(match bundle.value {
            Some(value) => SecretLookup::Found(value),
            None => SecretLookup::NotFound,
        })
    }

    fn backend_name(&self) -> &str {
        "azure-keyvault"
    }
}
