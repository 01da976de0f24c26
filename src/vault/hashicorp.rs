//! HashiCorp Vault KV v2 backend.
//!
//! Calls `GET {address}/v1/{mount}/data/{key}` with the token in the
//! `X-Vault-Token` header and reads one field of the secret's data map.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::{SecretLookup, VaultBackend};
use crate::config::HashicorpConfig;

// ── KV v2 API types ──────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct KvReadResponse {
    pub data: KvSecret,
}

#[derive(Deserialize)]
pub(super) struct KvSecret {
    pub data: HashMap<String, serde_json::Value>,
}

impl KvReadResponse {
    fn into_lookup(self, field: &str) -> SecretLookup {
        match self.data.data.get(field) {
            Some(serde_json::Value::String(value)) => SecretLookup::Found(value.clone()),
            Some(other) if !other.is_null() => SecretLookup::Found(other.to_string()),
            _ => SecretLookup::NotFound,
        }
    }
}

// ── HashicorpBackend ─────────────────────────────────────

pub struct HashicorpBackend {
    client: Client,
    address: String,
    token: String,
    mount: String,
    field: String,
}

impl HashicorpBackend {
    pub fn new(config: &HashicorpConfig) -> Self {
        Self {
            client: Client::new(),
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            mount: config.mount.trim_matches('/').to_string(),
            field: config.field.clone(),
        }
    }

    fn secret_url(&self, key: &str) -> String {
        format!("{}/v1/{}/data/{}", self.address, self.mount, key.trim_matches('/'))
    }
}

#[async_trait]
impl VaultBackend for HashicorpBackend {
    async fn fetch(&self, key: &str) -> anyhow::Result<SecretLookup> {
        let response = self
            .client
            .get(self.secret_url(key))
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SecretLookup::NotFound);
        }
        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("HashiCorp Vault returned {status}");
        }

        let kv: KvReadResponse = response.json().await?;
        Ok(kv.into_lookup(&self.field))
    }

    fn backend_name(&self) -> &str {
        "hashicorp"
    }
}
