//! AWS Secrets Manager backend.
//!
//! Request signing (SigV4) is not available to this engine, so the backend
//! always reports itself unavailable and callers get `None`.

use async_trait::async_trait;

use super::{SecretLookup, VaultBackend};

pub struct AwsSecretsBackend;

#[async_trait]
impl VaultBackend for AwsSecretsBackend {
    async fn fetch(&self, _key: &str) -> anyhow::Result<SecretLookup> {
        Ok(SecretLookup::Unavailable(
            "aws-secrets backend is not implemented".to_string(),
        ))
    }

    fn backend_name(&self) -> &str {
        "aws-secrets"
    }
}
