use std::collections::HashMap;

use async_trait::async_trait;
use common::config::GithubConfig;
use uuid::Uuid;

/// A decrypted, ready-to-use external-API credential.
#[derive(Debug, Clone)]
pub struct HostCredential {
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to decrypt github token")]
    Decrypt(#[source] anyhow::Error),
}

/// Resolves a stored credential for a platform user. `Ok(None)` means the
/// user has no token; `Err` means the stored ciphertext could not be used.
#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn credential_for(
        &self,
        user_id: Uuid,
    ) -> Result<Option<HostCredential>, CredentialError>;
}

/// Config-backed credential table. Production platforms plug in their own
/// encrypted store behind the same trait.
pub struct ConfigCredentialService {
    tokens: HashMap<Uuid, String>,
}

impl ConfigCredentialService {
    pub fn from_config(github: &GithubConfig) -> Self {
        let tokens = github
            .tokens
            .iter()
            .map(|entry| (entry.user_id, entry.token.clone()))
            .collect();
        Self { tokens }
    }
}

#[async_trait]
impl CredentialService for ConfigCredentialService {
    async fn credential_for(
        &self,
        user_id: Uuid,
    ) -> Result<Option<HostCredential>, CredentialError> {
        Ok(self.tokens.get(&user_id).map(|token| HostCredential {
            token: token.clone(),
        }))
    }
}
