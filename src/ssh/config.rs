//! Configuration resolution for the SSH session manager.
//!
//! Every value follows a three-tier priority:
//!
//! 1. **Parameter** - Explicitly provided function parameter (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection timeout in seconds |
//! | `SSH_INIT_TIMEOUT` | 10s | Shell initialization timeout in seconds |
//! | `SSH_COMMAND_TIMEOUT` | 15s | Per-command timeout in seconds |
//! | `SSH_POLL_INTERVAL_MS` | 50ms | Sleep between non-blocking stream checks |
//! | `SSH_SETUP_DELAY_MS` | 100ms | Pause after each shell setup line |
//! | `SSH_MAX_RETRIES` | 3 | Maximum connect retry attempts |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `SSH_TERMINAL_COLUMNS` | 250 | Pseudo-terminal width |
//! | `HTTP_PORT` | 8000 | HTTP listen port |

use std::env;
use std::str::FromStr;
use std::time::Duration;

pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub(crate) const DEFAULT_INIT_TIMEOUT_SECS: u64 = 10;
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 15;
pub(crate) const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
pub(crate) const DEFAULT_SETUP_DELAY_MS: u64 = 100;
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 3;
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
pub(crate) const DEFAULT_TERMINAL_COLUMNS: u32 = 250;
pub(crate) const DEFAULT_HTTP_PORT: u16 = 8000;

/// Maximum retry delay cap (10 seconds)
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const INIT_TIMEOUT_ENV_VAR: &str = "SSH_INIT_TIMEOUT";
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT";
pub(crate) const POLL_INTERVAL_MS_ENV_VAR: &str = "SSH_POLL_INTERVAL_MS";
pub(crate) const SETUP_DELAY_MS_ENV_VAR: &str = "SSH_SETUP_DELAY_MS";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const TERMINAL_COLUMNS_ENV_VAR: &str = "SSH_TERMINAL_COLUMNS";
pub(crate) const HTTP_PORT_ENV_VAR: &str = "HTTP_PORT";

/// Resolve a numeric value with priority: parameter -> env var -> default.
///
/// Unparseable environment values fall through to the default.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    if let Some(value) = param {
        return value;
    }

    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    default
}

pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_init_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        INIT_TIMEOUT_ENV_VAR,
        DEFAULT_INIT_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_command_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        COMMAND_TIMEOUT_ENV_VAR,
        DEFAULT_COMMAND_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_poll_interval(interval_param: Option<u64>) -> Duration {
    // A zero interval would turn the poll loop into a busy spin.
    Duration::from_millis(
        resolve(
            interval_param,
            POLL_INTERVAL_MS_ENV_VAR,
            DEFAULT_POLL_INTERVAL_MS,
        )
        .max(1),
    )
}

pub(crate) fn resolve_setup_delay(delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        delay_param,
        SETUP_DELAY_MS_ENV_VAR,
        DEFAULT_SETUP_DELAY_MS,
    ))
}

pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        retry_delay_param,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}

pub(crate) fn resolve_terminal_columns(columns_param: Option<u32>) -> u32 {
    resolve(
        columns_param,
        TERMINAL_COLUMNS_ENV_VAR,
        DEFAULT_TERMINAL_COLUMNS,
    )
}

pub fn resolve_http_port(port_param: Option<u16>) -> u16 {
    resolve(port_param, HTTP_PORT_ENV_VAR, DEFAULT_HTTP_PORT)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

/// Timings used by the shell protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSettings {
    /// Upper bound for observing the initialization marker.
    pub init_timeout: Duration,
    /// Upper bound for observing a command's exit-status tag.
    pub command_timeout: Duration,
    /// Sleep between non-blocking availability checks.
    pub poll_interval: Duration,
    /// Throttle after each setup line during initialization.
    pub setup_delay: Duration,
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            init_timeout: Duration::from_secs(DEFAULT_INIT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            setup_delay: Duration::from_millis(DEFAULT_SETUP_DELAY_MS),
        }
    }
}

/// Settings used when opening the SSH transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compress: bool,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            compress: true,
        }
    }
}

/// Pseudo-terminal geometry requested for each shell stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtySettings {
    pub terminal_type: String,
    pub columns: u32,
    pub rows: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    /// Capacity hint for the stream's read buffer, in bytes.
    pub buffer_size: usize,
}

impl Default for PtySettings {
    fn default() -> Self {
        Self {
            terminal_type: "xterm".to_string(),
            columns: DEFAULT_TERMINAL_COLUMNS,
            rows: 24,
            pixel_width: 800,
            pixel_height: 600,
            buffer_size: 1024,
        }
    }
}

/// Fully resolved configuration for the session service.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    pub protocol: ProtocolSettings,
    pub connect: ConnectSettings,
    pub pty: PtySettings,
}

impl ServiceConfig {
    /// Resolve every setting from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            protocol: ProtocolSettings {
                init_timeout: resolve_init_timeout(None),
                command_timeout: resolve_command_timeout(None),
                poll_interval: resolve_poll_interval(None),
                setup_delay: resolve_setup_delay(None),
            },
            connect: ConnectSettings {
                timeout: resolve_connect_timeout(None),
                max_retries: resolve_max_retries(None),
                retry_delay: resolve_retry_delay(None),
                compress: resolve_compression(None),
            },
            pty: PtySettings {
                columns: resolve_terminal_columns(None),
                ..PtySettings::default()
            },
        }
    }
}
