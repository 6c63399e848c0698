//! Persistence collaborator for sessions, command records and host configs.
//!
//! Every call commits on its own. The service treats a store failure as
//! non-fatal to its in-memory bookkeeping but surfaces it to the caller as
//! `SessionError::Persistence`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use super::error::SessionError;
use super::types::{CommandRecord, HostConfig, SshSession};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} already exists: {id}")]
    Duplicate { kind: &'static str, id: String },

    #[error("{kind} not found: {id}")]
    Missing { kind: &'static str, id: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::Persistence(e.to_string())
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn add_session(&self, session: &SshSession) -> Result<(), StoreError>;

    /// Overwrite an existing session.
    async fn update_session(&self, session: &SshSession) -> Result<(), StoreError>;

    async fn get_session_by_id(&self, id: &str) -> Result<Option<SshSession>, StoreError>;

    async fn add_command(&self, record: &CommandRecord) -> Result<(), StoreError>;

    /// Records of `session_id` in execution order.
    async fn commands_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<CommandRecord>, StoreError>;

    async fn add_host_config(&self, config: HostConfig) -> Result<Arc<HostConfig>, StoreError>;

    async fn get_host_config(&self, id: &str) -> Result<Option<Arc<HostConfig>>, StoreError>;

    async fn list_host_configs(&self) -> Result<Vec<Arc<HostConfig>>, StoreError>;

    /// Returns whether a config was deleted.
    async fn delete_host_config(&self, id: &str) -> Result<bool, StoreError>;
}

/// `DashMap`-backed store kept for the lifetime of the process.
pub struct InMemorySessionStore {
    sessions: DashMap<String, SshSession>,
    commands: DashMap<String, Vec<CommandRecord>>,
    hosts: DashMap<String, Arc<HostConfig>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            commands: DashMap::new(),
            hosts: DashMap::new(),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn add_session(&self, session: &SshSession) -> Result<(), StoreError> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                kind: "session",
                id: session.id.clone(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn update_session(&self, session: &SshSession) -> Result<(), StoreError> {
        let mut stored = self
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::Missing {
                kind: "session",
                id: session.id.clone(),
            })?;
        *stored = session.clone();
        Ok(())
    }

    async fn get_session_by_id(&self, id: &str) -> Result<Option<SshSession>, StoreError> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn add_command(&self, record: &CommandRecord) -> Result<(), StoreError> {
        let mut log = self.commands.entry(record.session_id.clone()).or_default();
        if log.iter().any(|existing| existing.id == record.id) {
            return Err(StoreError::Duplicate {
                kind: "command",
                id: record.id.clone(),
            });
        }
        log.push(record.clone());
        Ok(())
    }

    async fn commands_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<CommandRecord>, StoreError> {
        Ok(self
            .commands
            .get(session_id)
            .map(|log| log.value().clone())
            .unwrap_or_default())
    }

    async fn add_host_config(&self, config: HostConfig) -> Result<Arc<HostConfig>, StoreError> {
        match self.hosts.entry(config.id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate {
                kind: "host config",
                id: config.id,
            }),
            Entry::Vacant(slot) => {
                let config = Arc::new(config);
                slot.insert(config.clone());
                Ok(config)
            }
        }
    }

    async fn get_host_config(&self, id: &str) -> Result<Option<Arc<HostConfig>>, StoreError> {
        Ok(self.hosts.get(id).map(|entry| entry.value().clone()))
    }

    async fn list_host_configs(&self) -> Result<Vec<Arc<HostConfig>>, StoreError> {
        let mut configs: Vec<_> = self.hosts.iter().map(|e| e.value().clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(configs)
    }

    async fn delete_host_config(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.hosts.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::types::Credential;
    use chrono::Utc;

    fn session(id: &str) -> SshSession {
        SshSession {
            id: id.to_string(),
            host_config_id: "h1".to_string(),
            owner_id: None,
            started_at: Utc::now(),
            ended_at: None,
            initial_working_directory: None,
        }
    }

    fn host(id: &str) -> HostConfig {
        HostConfig {
            id: id.to_string(),
            hostname: "example.com".to_string(),
            port: 22,
            username: "deploy".to_string(),
            credential: Credential::Agent,
            owner_id: None,
        }
    }

    mod sessions {
        use super::*;

        #[tokio::test]
        async fn test_add_get_update() {
            let store = InMemorySessionStore::new();
            let mut s = session("s1");
            store.add_session(&s).await.unwrap();

            s.mark_ended(Utc::now());
            store.update_session(&s).await.unwrap();

            let loaded = store.get_session_by_id("s1").await.unwrap().unwrap();
            assert!(loaded.is_ended());
        }

        #[tokio::test]
        async fn test_duplicate_session_rejected() {
            let store = InMemorySessionStore::new();
            store.add_session(&session("s1")).await.unwrap();
            let err = store.add_session(&session("s1")).await.unwrap_err();
            assert!(matches!(err, StoreError::Duplicate { .. }));
        }

        #[tokio::test]
        async fn test_update_missing_session() {
            let store = InMemorySessionStore::new();
            let err = store.update_session(&session("nope")).await.unwrap_err();
            assert!(matches!(err, StoreError::Missing { .. }));

            let converted: SessionError = err.into();
            assert!(matches!(converted, SessionError::Persistence(_)));
        }

        #[tokio::test]
        async fn test_get_unknown_is_none() {
            let store = InMemorySessionStore::new();
            assert!(store.get_session_by_id("nope").await.unwrap().is_none());
        }
    }

    mod commands {
        use super::*;

        fn record(id: &str, session_id: &str) -> CommandRecord {
            CommandRecord {
                id: id.to_string(),
                session_id: session_id.to_string(),
                command_text: "uptime".to_string(),
                output: "up 3 days".to_string(),
                error_output: None,
                exit_code: 0,
                executed_at: Utc::now(),
            }
        }

        #[tokio::test]
        async fn test_commands_kept_in_order_per_session() {
            let store = InMemorySessionStore::new();
            store.add_command(&record("c1", "s1")).await.unwrap();
            store.add_command(&record("c2", "s2")).await.unwrap();
            store.add_command(&record("c3", "s1")).await.unwrap();

            let ids: Vec<_> = store
                .commands_for_session("s1")
                .await
                .unwrap()
                .into_iter()
                .map(|r| r.id)
                .collect();
            assert_eq!(ids, vec!["c1", "c3"]);
            assert!(store.commands_for_session("s9").await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn test_duplicate_command_id_rejected() {
            let store = InMemorySessionStore::new();
            store.add_command(&record("c1", "s1")).await.unwrap();
            assert!(store.add_command(&record("c1", "s1")).await.is_err());
        }
    }

    mod hosts {
        use super::*;

        #[tokio::test]
        async fn test_host_config_crud() {
            let store = InMemorySessionStore::new();
            store.add_host_config(host("b")).await.unwrap();
            store.add_host_config(host("a")).await.unwrap();
            assert!(store.add_host_config(host("a")).await.is_err());

            let ids: Vec<_> = store
                .list_host_configs()
                .await
                .unwrap()
                .iter()
                .map(|h| h.id.clone())
                .collect();
            assert_eq!(ids, vec!["a", "b"]);

            assert!(store.get_host_config("a").await.unwrap().is_some());
            assert!(store.delete_host_config("a").await.unwrap());
            assert!(!store.delete_host_config("a").await.unwrap());
            assert!(store.get_host_config("a").await.unwrap().is_none());
        }
    }
}
