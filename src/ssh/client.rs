//! SSH connection establishment.
//!
//! ## Connection Lifecycle
//!
//! 1. Build the russh client configuration (keepalive, compression).
//! 2. Open the TCP connection and run the handshake, bounded by the connect
//!    timeout.
//! 3. Authenticate with the [`AuthChain`] derived from the host credential.
//!
//! ## Retry Strategy
//!
//! Attempts use exponential backoff with jitter via `backon`, starting at the
//! configured retry delay and capped at [`MAX_RETRY_DELAY`]. Only errors that
//! [`is_retryable_error`] classifies as transient are retried; authentication
//! failures never are.
//!
//! Shell sessions sit idle between commands for arbitrary periods, so the
//! configuration carries no inactivity timeout and relies on keepalives.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use russh::{client, keys};
use tracing::{error, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::{ConnectSettings, MAX_RETRY_DELAY};
use super::error::{SessionError, is_retryable_error};
use super::types::HostConfig;

/// russh handler that accepts every server host key.
///
/// Equivalent to `StrictHostKeyChecking=no`. Host key verification against a
/// known_hosts file is not implemented.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        preferred: russh::Preferred {
            compression,
            ..Default::default()
        },
        ..Default::default()
    })
}

/// Connect and authenticate, retrying transient failures.
pub(crate) async fn connect_with_retry(
    host: &HostConfig,
    settings: &ConnectSettings,
) -> Result<client::Handle<SshClientHandler>, SessionError> {
    let attempt_counter = AtomicU32::new(0);
    let address = host.address();

    let backoff = ExponentialBuilder::default()
        .with_min_delay(settings.retry_delay)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_max_times(settings.max_retries as usize)
        .with_jitter();

    let result = (|| async {
        let attempt = attempt_counter.fetch_add(1, Ordering::SeqCst);
        if attempt > 0 {
            warn!(
                "SSH connection retry attempt {} to {}@{}",
                attempt, host.username, address
            );
        }
        connect_once(host, settings).await
    })
    .retry(backoff)
    .when(|e| {
        let retryable = is_retryable_error(e);
        if !retryable {
            warn!(
                "SSH connection to {}@{} failed with non-retryable error: {}",
                host.username, address, e
            );
        }
        retryable
    })
    .notify(|err, dur| {
        warn!("SSH connection failed: {}. Retrying in {:?}", err, dur);
    })
    .await;

    let total_attempts = attempt_counter.load(Ordering::SeqCst);
    match result {
        Ok(handle) => {
            info!(
                "SSH connection to {}@{} established after {} attempt(s)",
                host.username, address, total_attempts
            );
            Ok(handle)
        }
        Err(e) => {
            error!(
                "SSH connection to {}@{} failed after {} attempt(s). Last error: {}",
                host.username, address, total_attempts, e
            );
            Err(SessionError::connection(format!(
                "{}@{} unreachable after {} attempt(s): {}",
                host.username, address, total_attempts, e
            )))
        }
    }
}

async fn connect_once(
    host: &HostConfig,
    settings: &ConnectSettings,
) -> Result<client::Handle<SshClientHandler>, String> {
    let config = build_client_config(settings.compress);
    let connect_future = client::connect(
        config,
        (host.hostname.as_str(), host.port),
        SshClientHandler,
    );

    let mut handle = tokio::time::timeout(settings.timeout, connect_future)
        .await
        .map_err(|_| format!("Connection timed out after {:?}", settings.timeout))?
        .map_err(|e| format!("Failed to connect: {}", e))?;

    let chain = AuthChain::for_credential(&host.credential);
    if !chain.authenticate(&mut handle, &host.username).await? {
        return Err("Authentication failed: no authentication methods succeeded".to_string());
    }

    Ok(handle)
}
