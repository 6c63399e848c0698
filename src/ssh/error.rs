//! Error types for the session manager and connect retry classification.
//!
//! [`SessionError`] is the single failure type surfaced by the registry,
//! protocol engine and session service. Its variants are the operational
//! outcomes callers need to tell apart:
//!
//! - `NotFound`: the session id has no live entry.
//! - `UnknownHost`: the host configuration id is not stored.
//! - `InvalidHostConfig`: the host configuration was rejected before connecting.
//! - `ConnectionFailure`: the transport could not connect, or broke mid-operation.
//! - `Timeout`: a required marker did not show up within the allotted window.
//! - `Cancelled`: the caller's cancellation token fired during a poll-read.
//! - `Persistence`: the persistence collaborator failed.
//!
//! Partially present markers are not an error (they degrade to empty output
//! and an unknown exit code), and a registry partial insert is rolled back
//! and reported as a plain `false`.
//!
//! # Retry classification
//!
//! Connection attempts are retried based on the error message:
//!
//! 1. **Authentication failures (NOT retryable)**: wrong passwords, invalid keys,
//!    denied access. Retrying only risks locking the account.
//! 2. **Connection errors (retryable)**: refused, reset, timed out, unreachable.
//! 3. **Unknown errors**: retried unless they look like SSH protocol errors
//!    that do not also mention a timeout or connect problem.

use std::time::Duration;

use thiserror::Error;

/// Failure surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No live SSH session with ID: {0}")]
    NotFound(String),

    #[error("No host configuration with ID: {0}")]
    UnknownHost(String),

    #[error("Invalid host configuration: {0}")]
    InvalidHostConfig(String),

    #[error("SSH connection failure: {0}")]
    ConnectionFailure(String),

    #[error("Timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        elapsed: Duration,
    },

    #[error("Operation cancelled while waiting for {waiting_for}")]
    Cancelled { waiting_for: &'static str },

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl SessionError {
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        SessionError::ConnectionFailure(message.into())
    }

    /// True for the "session does not exist" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SessionError::NotFound(_) | SessionError::UnknownHost(_)
        )
    }

    /// True for expected, retryable waiting failures.
    pub fn is_timeout_or_cancelled(&self) -> bool {
        matches!(
            self,
            SessionError::Timeout { .. } | SessionError::Cancelled { .. }
        )
    }

    /// Hint appended to user-visible messages by the HTTP layer.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SessionError::Timeout { .. } | SessionError::Cancelled { .. } => {
                Some("the session is still live; retry the command or end the session")
            }
            SessionError::ConnectionFailure(_) => {
                Some("the host may be unreachable; check hostname, port and credentials")
            }
            _ => None,
        }
    }
}

/// Authentication error patterns that indicate permanent failures.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "failed to load private key",
];

/// Connection error patterns that indicate transient failures.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timed out",
    "timeout",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
];

/// Determines if a connect error is transient and worth retrying.
///
/// Authentication patterns are checked first, so a message mentioning both a
/// timeout and a rejected credential is not retried.
pub(crate) fn is_retryable_error(error: &str) -> bool {
    let error_lower = error.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return false;
    }

    if RETRYABLE_ERRORS.iter().any(|p| error_lower.contains(p)) {
        return true;
    }

    !error_lower.contains("ssh") || error_lower.contains("connect")
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classification {
        use super::*;

        #[test]
        fn test_auth_failures_not_retryable() {
            assert!(!is_retryable_error("Password authentication failed"));
            assert!(!is_retryable_error("Permission denied (publickey)"));
            assert!(!is_retryable_error("password authentication rejected"));
            assert!(!is_retryable_error(
                "Failed to load private key from \"/nope\": No such file"
            ));
        }

        #[test]
        fn test_connection_errors_retryable() {
            assert!(is_retryable_error("Connection refused (os error 111)"));
            assert!(is_retryable_error("Connection timed out after 30s"));
            assert!(is_retryable_error("Network is unreachable"));
            assert!(is_retryable_error("Failed to connect: broken pipe"));
        }

        #[test]
        fn test_auth_takes_priority_over_timeout() {
            assert!(!is_retryable_error(
                "timeout while authentication failed for user"
            ));
        }

        #[test]
        fn test_ssh_protocol_error_not_retryable() {
            assert!(!is_retryable_error("SSH protocol error: bad packet"));
            assert!(is_retryable_error("SSH connect aborted"));
        }

        #[test]
        fn test_unknown_errors_retryable() {
            assert!(is_retryable_error("something odd happened"));
        }
    }

    mod session_error {
        use super::*;

        #[test]
        fn test_predicates() {
            assert!(SessionError::NotFound("x".into()).is_not_found());
            assert!(SessionError::UnknownHost("h".into()).is_not_found());
            assert!(
                SessionError::Timeout {
                    waiting_for: "exit status",
                    elapsed: Duration::from_secs(1),
                }
                .is_timeout_or_cancelled()
            );
            assert!(
                SessionError::Cancelled {
                    waiting_for: "exit status"
                }
                .is_timeout_or_cancelled()
            );
            assert!(!SessionError::connection("down").is_timeout_or_cancelled());
        }

        #[test]
        fn test_display_mentions_session_id() {
            let err = SessionError::NotFound("abc-123".into());
            assert!(err.to_string().contains("abc-123"));
        }

        #[test]
        fn test_hints() {
            assert!(SessionError::connection("x").hint().is_some());
            assert!(SessionError::NotFound("x".into()).hint().is_none());
        }
    }
}
