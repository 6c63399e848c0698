//! Domain records and serializable request/response types.
//!
//! Host configurations carry credential material in `secrecy` wrappers and
//! are never serialized; [`HostConfigView`] is the public projection.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use super::error::SessionError;

/// How the transport authenticates against the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Password,
    Key,
    Agent,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthType::Password => write!(f, "password"),
            AuthType::Key => write!(f, "key"),
            AuthType::Agent => write!(f, "agent"),
        }
    }
}

/// Credential material for one host.
#[derive(Debug)]
pub enum Credential {
    Password(SecretString),
    KeyFile {
        path: PathBuf,
        passphrase: Option<SecretString>,
    },
    /// Identities offered by the local SSH agent (`SSH_AUTH_SOCK`).
    Agent,
}

impl Credential {
    pub fn auth_type(&self) -> AuthType {
        match self {
            Credential::Password(_) => AuthType::Password,
            Credential::KeyFile { .. } => AuthType::Key,
            Credential::Agent => AuthType::Agent,
        }
    }
}

/// Connection settings for one remote host.
#[derive(Debug)]
pub struct HostConfig {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
    pub owner_id: Option<String>,
}

impl HostConfig {
    /// Reject configurations that cannot possibly connect.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.hostname.trim().is_empty() {
            return Err(SessionError::InvalidHostConfig(
                "hostname must not be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(SessionError::InvalidHostConfig(
                "port must be between 1 and 65535".to_string(),
            ));
        }
        if self.username.trim().is_empty() {
            return Err(SessionError::InvalidHostConfig(
                "username must not be empty".to_string(),
            ));
        }
        if let Credential::KeyFile { path, .. } = &self.credential
            && path.as_os_str().is_empty()
        {
            return Err(SessionError::InvalidHostConfig(
                "key authentication requires a key path".to_string(),
            ));
        }
        Ok(())
    }

    /// `hostname:port` as used in log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn view(&self) -> HostConfigView {
        HostConfigView {
            id: self.id.clone(),
            hostname: self.hostname.clone(),
            port: self.port,
            username: self.username.clone(),
            auth_type: self.credential.auth_type(),
            owner_id: self.owner_id.clone(),
        }
    }
}

/// One remote-shell session as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshSession {
    pub id: String,
    pub host_config_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub started_at: DateTime<Utc>,
    /// Set once when the session ends, never reset.
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Best-effort `pwd` captured right after initialization.
    #[serde(default)]
    pub initial_working_directory: Option<String>,
}

impl SshSession {
    /// Stamp the end time unless already set. Returns whether it changed.
    pub fn mark_ended(&mut self, at: DateTime<Utc>) -> bool {
        if self.ended_at.is_some() {
            return false;
        }
        self.ended_at = Some(at);
        true
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// One executed command within a session. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub id: String,
    pub session_id: String,
    pub command_text: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_output: Option<String>,
    /// -1 when the exit status could not be parsed.
    pub exit_code: i32,
    pub executed_at: DateTime<Utc>,
}

/// Result triple of a framed command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub output: String,
    /// Always empty: stderr is merged into stdout by the framing.
    pub error_output: String,
    pub exit_code: i32,
}

/// Host configuration as exposed over HTTP, without credential material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfigView {
    pub id: String,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

/// Body of `POST /hosts`.
#[derive(Debug, Deserialize)]
pub struct CreateHostConfigRequest {
    pub hostname: String,
    /// Defaults to 22
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    pub auth_type: AuthType,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub key_passphrase: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

impl CreateHostConfigRequest {
    /// Build a validated host configuration under `id`.
    pub fn into_host_config(self, id: String) -> Result<HostConfig, SessionError> {
        let credential = match self.auth_type {
            AuthType::Password => {
                let password = self.password.ok_or_else(|| {
                    SessionError::InvalidHostConfig(
                        "password authentication requires a password".to_string(),
                    )
                })?;
                Credential::Password(SecretString::from(password))
            }
            AuthType::Key => {
                let path = self.key_path.ok_or_else(|| {
                    SessionError::InvalidHostConfig(
                        "key authentication requires a key path".to_string(),
                    )
                })?;
                Credential::KeyFile {
                    path: PathBuf::from(path),
                    passphrase: self.key_passphrase.map(SecretString::from),
                }
            }
            AuthType::Agent => Credential::Agent,
        };

        let config = HostConfig {
            id,
            hostname: self.hostname,
            port: self.port.unwrap_or(22),
            username: self.username,
            credential,
            owner_id: self.owner_id,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostConfigListResponse {
    pub hosts: Vec<HostConfigView>,
    pub count: usize,
}

/// Body of `POST /sessions`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub host_config_id: String,
}

/// Body of `POST /sessions/:id/commands`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteCommandRequest {
    pub command: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndSessionResponse {
    pub session_id: String,
    pub ended: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    /// Ids of sessions currently live in the registry
    pub sessions: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CommandListResponse {
    pub session_id: String,
    pub commands: Vec<CommandRecord>,
    pub count: usize,
}
