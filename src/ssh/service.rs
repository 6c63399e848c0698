//! Session orchestration used by the HTTP layer.
//!
//! [`SessionService`] ties the collaborators together:
//!
//! 1. validate the host configuration,
//! 2. connect through the [`TransportConnector`],
//! 3. open a shell stream and initialize it with the [`ShellProtocol`],
//! 4. persist the session and register its resources.
//!
//! Anything that fails after the connect releases the transport and stream
//! before the error is returned. Commands on one session are serialized by
//! the stream mutex; commands on different sessions run in parallel.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{PtySettings, ServiceConfig};
use super::error::SessionError;
use super::protocol::ShellProtocol;
use super::registry::{SessionRegistry, release_resources};
use super::store::SessionStore;
use super::transport::{SharedShellStream, ShellTransport, TransportConnector, share_stream};
use super::types::{
    CommandOutput, CommandRecord, CreateHostConfigRequest, HostConfig, HostConfigView, SshSession,
};

pub struct SessionService {
    registry: SessionRegistry,
    connector: Arc<dyn TransportConnector>,
    store: Arc<dyn SessionStore>,
    protocol: ShellProtocol,
    pty: PtySettings,
}

impl SessionService {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        store: Arc<dyn SessionStore>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            registry: SessionRegistry::new(),
            connector,
            store,
            protocol: ShellProtocol::new(config.protocol),
            pty: config.pty,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Open, initialize and register a new shell session on `host`.
    pub async fn start_session(
        &self,
        host: &HostConfig,
        cancel: &CancellationToken,
    ) -> Result<SshSession, SessionError> {
        host.validate()?;

        info!(host = %host.address(), user = %host.username, "Starting shell session");
        let transport = self.connector.connect(host).await?;

        let session_id = Uuid::new_v4().to_string();
        let (stream, working_directory) = match self.open_shell(&transport, cancel).await {
            Ok(opened) => opened,
            Err((e, stream)) => {
                warn!(session_id = %session_id, error = %e, "Shell setup failed, releasing connection");
                release_resources(&session_id, &transport, stream.as_ref()).await;
                return Err(e);
            }
        };

        // The working-directory lookup swallows errors, including cancellation.
        if cancel.is_cancelled() {
            info!(session_id = %session_id, "Session start cancelled, releasing connection");
            release_resources(&session_id, &transport, Some(&stream)).await;
            return Err(SessionError::Cancelled {
                waiting_for: "session start",
            });
        }

        let session = SshSession {
            id: session_id.clone(),
            host_config_id: host.id.clone(),
            owner_id: host.owner_id.clone(),
            started_at: Utc::now(),
            ended_at: None,
            initial_working_directory: working_directory,
        };

        if let Err(e) = self.store.add_session(&session).await {
            warn!(session_id = %session_id, error = %e, "Failed to persist session, releasing connection");
            release_resources(&session_id, &transport, Some(&stream)).await;
            return Err(e.into());
        }

        if !self
            .registry
            .add_session(&session_id, transport.clone(), stream.clone())
        {
            release_resources(&session_id, &transport, Some(&stream)).await;
            self.stamp_ended(&session_id).await;
            return Err(SessionError::connection(format!(
                "session {} could not be registered",
                session_id
            )));
        }

        info!(
            session_id = %session_id,
            host = %host.address(),
            cwd = ?session.initial_working_directory,
            "Shell session started"
        );
        Ok(session)
    }

    /// Create the stream, initialize it and capture the working directory.
    ///
    /// On failure the stream, if one was created, is handed back so the
    /// caller can release it together with the transport.
    async fn open_shell(
        &self,
        transport: &Arc<dyn ShellTransport>,
        cancel: &CancellationToken,
    ) -> Result<(SharedShellStream, Option<String>), (SessionError, Option<SharedShellStream>)> {
        let stream = transport
            .create_shell_stream(&self.pty)
            .await
            .map_err(|e| (e, None))?;
        let stream = share_stream(stream);

        let working_directory = {
            let mut guard = stream.lock().await;
            if let Err(e) = self.protocol.initialize(&mut **guard, cancel).await {
                drop(guard);
                return Err((e, Some(stream)));
            }

            match self.protocol.execute(&mut **guard, "pwd", cancel).await {
                Ok(out) if out.exit_code == 0 && !out.output.is_empty() => Some(out.output),
                Ok(out) => {
                    debug!(exit_code = out.exit_code, "pwd gave no usable output");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "Could not determine initial working directory");
                    None
                }
            }
        };

        Ok((stream, working_directory))
    }

    /// Run `command` on a live session.
    ///
    /// Waits for any command already running on the same session. A timeout
    /// or cancellation creates no record and leaves the session live.
    pub async fn execute_command(
        &self,
        session_id: &str,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError> {
        let stream = self
            .registry
            .try_get_stream(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        let mut guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(SessionError::Cancelled { waiting_for: "session lock" });
            }
            guard = stream.lock() => guard,
        };

        // The session may have ended while this call waited for the lock.
        if !self.registry.contains(session_id) {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let output = self.protocol.execute(&mut **guard, command, cancel).await?;

        let record = CommandRecord {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            command_text: command.to_string(),
            output: output.output.clone(),
            error_output: (!output.error_output.is_empty()).then(|| output.error_output.clone()),
            exit_code: output.exit_code,
            executed_at: Utc::now(),
        };
        self.registry.append_command(session_id, record.clone()).await;
        drop(guard);

        info!(
            session_id = %session_id,
            exit_code = output.exit_code,
            "Command executed"
        );

        if let Err(e) = self.store.add_command(&record).await {
            warn!(session_id = %session_id, command_id = %record.id, error = %e, "Failed to persist command record");
            return Err(e.into());
        }
        Ok(output)
    }

    /// Tear down a live session and stamp its end time.
    ///
    /// Unknown and already-ended sessions yield `NotFound`.
    pub async fn end_session(&self, session_id: &str) -> Result<(), SessionError> {
        if !self.registry.remove_session(session_id).await {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        let Some(mut session) = self.store.get_session_by_id(session_id).await? else {
            warn!(session_id = %session_id, "Ended session has no persisted record");
            return Ok(());
        };
        if session.mark_ended(Utc::now()) {
            self.store.update_session(&session).await?;
        }
        info!(session_id = %session_id, "Shell session ended");
        Ok(())
    }

    /// Persisted record of a session, live or ended.
    pub async fn get_session(&self, session_id: &str) -> Result<SshSession, SessionError> {
        self.store
            .get_session_by_id(session_id)
            .await?
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Ids of live sessions, sorted.
    pub fn list_sessions(&self) -> Vec<String> {
        let mut ids = self.registry.session_ids();
        ids.sort();
        ids
    }

    /// In-memory command log of a live session.
    pub async fn session_commands(
        &self,
        session_id: &str,
    ) -> Result<Vec<CommandRecord>, SessionError> {
        self.registry
            .try_get_commands(session_id)
            .await
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Force-remove every live session and stamp end times best-effort.
    pub async fn shutdown(&self) {
        let removed = self.registry.shutdown().await;
        join_all(removed.iter().map(|id| self.stamp_ended(id))).await;
        info!(count = removed.len(), "Session service shut down");
    }

    async fn stamp_ended(&self, session_id: &str) {
        let result = async {
            if let Some(mut session) = self.store.get_session_by_id(session_id).await?
                && session.mark_ended(Utc::now())
            {
                self.store.update_session(&session).await?;
            }
            Ok::<_, SessionError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(session_id = %session_id, error = %e, "Failed to record session end");
        }
    }

    pub async fn add_host_config(
        &self,
        request: CreateHostConfigRequest,
    ) -> Result<HostConfigView, SessionError> {
        let config = request.into_host_config(Uuid::new_v4().to_string())?;
        let stored = self.store.add_host_config(config).await?;
        info!(host_config_id = %stored.id, host = %stored.address(), "Host configuration added");
        Ok(stored.view())
    }

    pub async fn host_config(&self, id: &str) -> Result<Arc<HostConfig>, SessionError> {
        self.store
            .get_host_config(id)
            .await?
            .ok_or_else(|| SessionError::UnknownHost(id.to_string()))
    }

    pub async fn list_host_configs(&self) -> Result<Vec<HostConfigView>, SessionError> {
        Ok(self
            .store
            .list_host_configs()
            .await?
            .iter()
            .map(|config| config.view())
            .collect())
    }

    pub async fn delete_host_config(&self, id: &str) -> Result<(), SessionError> {
        if self.store.delete_host_config(id).await? {
            Ok(())
        } else {
            Err(SessionError::UnknownHost(id.to_string()))
        }
    }

    /// Start a session on a stored host configuration.
    pub async fn start_session_for_host(
        &self,
        host_config_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SshSession, SessionError> {
        let host = self.host_config(host_config_id).await?;
        self.start_session(&host, cancel).await
    }
}
