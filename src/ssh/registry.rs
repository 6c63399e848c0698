//! In-memory registry of live sessions.
//!
//! Holds three `DashMap`s keyed by session id: the transport, the shared
//! shell stream and the command log. Inserts go through the `entry` API so a
//! check-then-act race cannot let two callers claim the same id, and a
//! partially inserted session is rolled back before `add_session` reports
//! failure.
//!
//! Each command log sits behind its own mutex, so appending to one session
//! never blocks lookups on another.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::transport::{SharedShellStream, ShellTransport};
use super::types::CommandRecord;

type CommandLog = Arc<Mutex<Vec<CommandRecord>>>;

pub struct SessionRegistry {
    transports: DashMap<String, Arc<dyn ShellTransport>>,
    streams: DashMap<String, SharedShellStream>,
    commands: DashMap<String, CommandLog>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            transports: DashMap::new(),
            streams: DashMap::new(),
            commands: DashMap::new(),
        }
    }

    /// Register the resources of a live session.
    ///
    /// Returns `false` when `id` is already taken. The registry then holds
    /// no reference to `transport` or `stream`, and releasing them is up to
    /// the caller.
    pub fn add_session(
        &self,
        id: &str,
        transport: Arc<dyn ShellTransport>,
        stream: SharedShellStream,
    ) -> bool {
        match self.transports.entry(id.to_string()) {
            Entry::Occupied(_) => {
                debug!(session_id = %id, "Session id already registered");
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(transport.clone());
            }
        }

        let stream_inserted = match self.streams.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(stream.clone());
                true
            }
        };
        if !stream_inserted {
            self.transports
                .remove_if(id, |_, held| Arc::ptr_eq(held, &transport));
            warn!(session_id = %id, "Rolled back partial session insert (stream)");
            return false;
        }

        let log_inserted = match self.commands.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(Vec::new())));
                true
            }
        };
        if !log_inserted {
            self.streams
                .remove_if(id, |_, held| Arc::ptr_eq(held, &stream));
            self.transports
                .remove_if(id, |_, held| Arc::ptr_eq(held, &transport));
            warn!(session_id = %id, "Rolled back partial session insert (command log)");
            return false;
        }

        debug!(session_id = %id, "Session registered");
        true
    }

    /// Pop and release the resources of `id`.
    ///
    /// Returns `false` without side effects when the session is unknown,
    /// including when it was already removed.
    pub async fn remove_session(&self, id: &str) -> bool {
        let Some((_, transport)) = self.transports.remove(id) else {
            return false;
        };
        let stream = self.streams.remove(id).map(|(_, stream)| stream);
        self.commands.remove(id);

        release_resources(id, &transport, stream.as_ref()).await;
        info!(session_id = %id, "Session removed");
        true
    }

    pub fn try_get_transport(&self, id: &str) -> Option<Arc<dyn ShellTransport>> {
        self.transports.get(id).map(|entry| entry.value().clone())
    }

    pub fn try_get_stream(&self, id: &str) -> Option<SharedShellStream> {
        self.streams.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of the command log of `id`.
    pub async fn try_get_commands(&self, id: &str) -> Option<Vec<CommandRecord>> {
        // Clone the Arc first so the shard guard is not held across the await.
        let log = self.commands.get(id).map(|entry| entry.value().clone())?;
        let records = log.lock().await;
        Some(records.clone())
    }

    /// Append to the command log of `id`. Unknown ids are logged and ignored.
    pub async fn append_command(&self, id: &str, record: CommandRecord) {
        let Some(log) = self.commands.get(id).map(|entry| entry.value().clone()) else {
            warn!(session_id = %id, command_id = %record.id, "Dropping command record for unknown session");
            return;
        };
        log.lock().await.push(record);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.transports.contains_key(id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.transports.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// Force-remove every live session. Returns the ids that were removed.
    pub async fn shutdown(&self) -> Vec<String> {
        let ids = self.session_ids();
        if ids.is_empty() {
            return ids;
        }
        info!(count = ids.len(), "Tearing down live sessions");

        let results = join_all(ids.iter().map(|id| self.remove_session(id))).await;
        ids.into_iter()
            .zip(results)
            .filter_map(|(id, removed)| removed.then_some(id))
            .collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Disconnect `transport`, then close `stream`. Errors are logged only.
///
/// The transport goes first so a command still holding the stream lock
/// fails fast instead of running out its timeout.
pub(crate) async fn release_resources(
    id: &str,
    transport: &Arc<dyn ShellTransport>,
    stream: Option<&SharedShellStream>,
) {
    if let Err(e) = transport.disconnect().await {
        warn!(session_id = %id, error = %e, "Failed to disconnect transport");
    }
    if let Some(stream) = stream
        && let Err(e) = stream.lock().await.close().await
    {
        warn!(session_id = %id, error = %e, "Failed to close shell stream");
    }
}
