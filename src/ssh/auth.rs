//! Authentication strategies applied after the SSH handshake.
//!
//! A host's [`Credential`] is turned into an [`AuthChain`] that tries each
//! strategy in order and stops at the first success.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::client::SshClientHandler;
use super::types::Credential;

#[async_trait]
pub(crate) trait AuthStrategy: Send + Sync {
    /// `Ok(false)` means the server rejected the credential.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    fn name(&self) -> &'static str;
}

pub(crate) struct PasswordAuth {
    password: SecretString,
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, self.password.expose_secret())
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

/// Private key file, optionally protected by a passphrase.
pub(crate) struct KeyAuth {
    path: PathBuf,
    passphrase: Option<SecretString>,
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let passphrase = self.passphrase.as_ref().map(|p| p.expose_secret());
        let key = keys::load_secret_key(&self.path, passphrase).map_err(|e| {
            format!(
                "Failed to load private key from {}: {}",
                self.path.display(),
                e
            )
        })?;

        // RSA keys need the strongest hash the server accepts.
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!(?hash_alg, "Key authentication hash algorithm");

        let result = handle
            .authenticate_publickey(
                username,
                keys::PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;
        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}

/// Identities held by the agent behind `SSH_AUTH_SOCK`.
pub(crate) struct AgentAuth;

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = keys::agent::client::AgentClient::connect_env()
            .await
            .map_err(|e| format!("Failed to connect to SSH agent: {}", e))?;

        let identities = agent
            .request_identities()
            .await
            .map_err(|e| format!("Failed to get identities from SSH agent: {}", e))?;
        if identities.is_empty() {
            return Err("No identities found in SSH agent".to_string());
        }

        for identity in identities {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();

            match handle
                .authenticate_publickey_with(username, identity.clone(), hash_alg, &mut agent)
                .await
            {
                Ok(result) if result.success() => return Ok(true),
                Ok(_) => debug!(comment = ?identity.comment(), "Agent identity rejected"),
                Err(e) => debug!(error = %e, "Agent identity failed"),
            }
        }

        Err("Agent authentication failed: no identities accepted".to_string())
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

/// Strategies tried in insertion order.
pub(crate) struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub(crate) fn for_credential(credential: &Credential) -> Self {
        let strategy: Box<dyn AuthStrategy> = match credential {
            Credential::Password(password) => Box::new(PasswordAuth {
                password: SecretString::from(password.expose_secret().to_string()),
            }),
            Credential::KeyFile { path, passphrase } => Box::new(KeyAuth {
                path: path.clone(),
                passphrase: passphrase
                    .as_ref()
                    .map(|p| SecretString::from(p.expose_secret().to_string())),
            }),
            Credential::Agent => Box::new(AgentAuth),
        };
        Self {
            strategies: vec![strategy],
        }
    }

    #[cfg(test)]
    fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("No authentication strategies configured".to_string());
        }

        let mut last_error = None;
        for strategy in &self.strategies {
            debug!(strategy = strategy.name(), "Trying authentication strategy");
            match strategy.authenticate(handle, username).await {
                Ok(true) => return Ok(true),
                Ok(false) => {
                    last_error = Some(format!("{} authentication rejected", strategy.name()));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| "All authentication methods failed".to_string()))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
