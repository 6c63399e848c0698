//! Capability traits for the remote shell transport.
//!
//! The session manager never talks to an SSH library directly. It drives
//! three seams:
//!
//! - [`TransportConnector`]: opens an authenticated connection for a host.
//! - [`ShellTransport`]: one live connection, able to open a pseudo-terminal
//!   backed [`ShellStream`] and to disconnect.
//! - [`ShellStream`]: the duplex byte channel the protocol engine frames
//!   commands over. Reads are non-blocking: the engine polls
//!   [`ShellStream::data_available`] and sleeps between checks.
//!
//! The russh-backed implementations live in `shell.rs`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::config::PtySettings;
use super::error::SessionError;
use super::types::HostConfig;

/// Opens transports to remote hosts.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Connect and authenticate. Fails with `ConnectionFailure`.
    async fn connect(&self, host: &HostConfig) -> Result<Arc<dyn ShellTransport>, SessionError>;
}

/// One connected, authenticated SSH connection.
#[async_trait]
pub trait ShellTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open a pseudo-terminal channel running an interactive shell.
    async fn create_shell_stream(
        &self,
        pty: &PtySettings,
    ) -> Result<Box<dyn ShellStream>, SessionError>;

    /// Disconnect. Succeeds when the connection is already gone.
    async fn disconnect(&self) -> Result<(), SessionError>;
}

/// Duplex pseudo-terminal stream bound to one session.
#[async_trait]
pub trait ShellStream: Send {
    /// Write `line` followed by a newline.
    async fn write_line(&mut self, line: &str) -> Result<(), SessionError>;

    async fn flush(&mut self) -> Result<(), SessionError>;

    /// Non-blocking check for readable data.
    ///
    /// Errors once the remote side has closed the channel and nothing is
    /// left to read.
    fn data_available(&mut self) -> Result<bool, SessionError>;

    /// Non-blocking drain of everything currently readable.
    fn read(&mut self) -> Result<String, SessionError>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&mut self) -> Result<(), SessionError>;
}

/// Shell stream shared between the registry and command executions.
///
/// The mutex is the per-session execution lock: holding it is what keeps a
/// second command off the stream until the first one is framed and parsed.
pub type SharedShellStream = Arc<Mutex<Box<dyn ShellStream>>>;

pub fn share_stream(stream: Box<dyn ShellStream>) -> SharedShellStream {
    Arc::new(Mutex::new(stream))
}
