//! russh-backed implementations of the transport traits.
//!
//! A shell stream is a session channel with a pseudo-terminal and an
//! interactive shell. The channel is split: a background task pumps the
//! read half into an unbounded queue, and the write half stays with the
//! stream. That keeps `data_available` and `read` non-blocking, which is
//! what the poll-read loop expects.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::{ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::client::{SshClientHandler, connect_with_retry};
use super::config::{ConnectSettings, PtySettings};
use super::error::SessionError;
use super::transport::{ShellStream, ShellTransport, TransportConnector};
use super::types::HostConfig;

/// Opens [`RusshTransport`]s.
pub struct RusshConnector {
    settings: ConnectSettings,
}

impl RusshConnector {
    pub fn new(settings: ConnectSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl TransportConnector for RusshConnector {
    async fn connect(&self, host: &HostConfig) -> Result<Arc<dyn ShellTransport>, SessionError> {
        let handle = connect_with_retry(host, &self.settings).await?;
        Ok(Arc::new(RusshTransport {
            handle,
            address: host.address(),
        }))
    }
}

pub struct RusshTransport {
    handle: client::Handle<SshClientHandler>,
    address: String,
}

#[async_trait]
impl ShellTransport for RusshTransport {
    fn is_connected(&self) -> bool {
        !self.handle.is_closed()
    }

    async fn create_shell_stream(
        &self,
        pty: &PtySettings,
    ) -> Result<Box<dyn ShellStream>, SessionError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| SessionError::connection(format!("Failed to open channel: {}", e)))?;

        channel
            .request_pty(
                false,
                &pty.terminal_type,
                pty.columns,
                pty.rows,
                pty.pixel_width,
                pty.pixel_height,
                &[],
            )
            .await
            .map_err(|e| SessionError::connection(format!("Failed to request PTY: {}", e)))?;

        channel
            .request_shell(false)
            .await
            .map_err(|e| SessionError::connection(format!("Failed to start shell: {}", e)))?;

        let (read_half, write_half) = channel.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(pump_output(read_half, tx, cancel.clone()));

        debug!(address = %self.address, columns = pty.columns, "Shell stream opened");
        Ok(Box::new(RusshShellStream {
            writer: write_half,
            incoming: rx,
            pending: Vec::with_capacity(pty.buffer_size),
            cancel,
            closed: false,
        }))
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        if self.handle.is_closed() {
            return Ok(());
        }
        match self
            .handle
            .disconnect(Disconnect::ByApplication, "session ended", "en")
            .await
        {
            Ok(()) => {
                info!(address = %self.address, "SSH connection closed");
                Ok(())
            }
            Err(_) if self.handle.is_closed() => Ok(()),
            Err(e) => Err(SessionError::connection(format!(
                "Failed to disconnect from {}: {}",
                self.address, e
            ))),
        }
    }
}

/// Forward channel output until the channel closes or `cancel` fires.
///
/// Dropping `tx` on exit is how the stream learns the channel is gone.
async fn pump_output(
    mut read_half: ChannelReadHalf,
    tx: UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = read_half.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    if tx.send(data.to_vec()).is_err() {
                        break;
                    }
                }
                // A PTY merges stderr already; forward anything else the server sends.
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if tx.send(data.to_vec()).is_err() {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "Remote shell exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }
}

pub struct RusshShellStream {
    writer: ChannelWriteHalf<Msg>,
    incoming: UnboundedReceiver<Vec<u8>>,
    /// Bytes received but not yet returned by `read`.
    pending: Vec<u8>,
    cancel: CancellationToken,
    closed: bool,
}

impl RusshShellStream {
    /// Move queued chunks into `pending`. Errors once the reader is gone and
    /// nothing decodable is left.
    fn fill_pending(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::connection("shell stream is closed"));
        }
        loop {
            match self.incoming.try_recv() {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    if decodable_len(&self.pending) == 0 {
                        return Err(SessionError::connection("remote shell closed the channel"));
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[async_trait]
impl ShellStream for RusshShellStream {
    async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::connection("shell stream is closed"));
        }
        let mut bytes = Vec::with_capacity(line.len() + 1);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
        self.writer
            .data(&bytes[..])
            .await
            .map_err(|e| SessionError::connection(format!("Failed to write to shell: {}", e)))
    }

    async fn flush(&mut self) -> Result<(), SessionError> {
        // Channel data is handed to the session loop as soon as it is written.
        Ok(())
    }

    fn data_available(&mut self) -> Result<bool, SessionError> {
        self.fill_pending()?;
        Ok(decodable_len(&self.pending) > 0)
    }

    fn read(&mut self) -> Result<String, SessionError> {
        self.fill_pending()?;
        Ok(take_utf8(&mut self.pending))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cancel.cancel();
        // Fails when the connection is already gone, which is fine here.
        if let Err(e) = self.writer.close().await {
            debug!(error = %e, "Shell channel already closed");
        }
        Ok(())
    }
}

impl Drop for RusshShellStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Length of the prefix that can be decoded now: everything except a
/// trailing incomplete UTF-8 sequence.
fn decodable_len(pending: &[u8]) -> usize {
    match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    }
}

/// Decode the longest valid prefix of `pending`, keeping a trailing
/// incomplete UTF-8 sequence for the next read.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let cut = decodable_len(pending);
    let rest = pending.split_off(cut);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}
