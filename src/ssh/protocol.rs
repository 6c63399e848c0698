//! Shell protocol engine: framing commands over a raw pseudo-terminal stream.
//!
//! An interactive shell gives back one unstructured, possibly colored byte
//! stream. The engine turns it into request/response pairs:
//!
//! 1. **Initialization** switches the remote side to a clean, predictable
//!    shell (no rc files, dumb terminal, no colors, no aliases, synthetic
//!    prompt) and waits for a unique ready marker.
//! 2. **Execution** wraps each command between a start and an end marker,
//!    merges stderr into stdout, and echoes the exit status behind
//!    [`EXIT_CODE_TAG`]. The stream is polled until the tag follows the
//!    second end marker with a complete number after it.
//! 3. **Parsing** strips escape sequences, then takes the text between the
//!    *second* start/end marker pair. The first pair is the shell echoing the
//!    typed command line back, the second one is the actual output.
//!
//! Missing markers degrade to empty output and a missing or garbled exit
//! status degrades to `-1`; only a timeout, a cancellation or a transport
//! error fails a command.

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::ProtocolSettings;
use super::error::SessionError;
use super::transport::ShellStream;
use super::types::CommandOutput;

/// Tag echoed in front of the command's exit status.
pub const EXIT_CODE_TAG: &str = "EXIT_CODE:";

/// Exit code recorded when the status could not be parsed.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

const MARKER_PREFIX: &str = "__SSHSM_";

/// Prompt installed during initialization.
pub(crate) const SHELL_PROMPT: &str = "__SSHSM_PROMPT__$ ";

/// Variable holding the wrapped command's status until it is echoed.
const STATUS_VAR: &str = "__sshsm_rc";

/// How far back completion checks rescan when a new chunk arrives.
const TAIL_OVERLAP: usize = 128;

/// Lines sent right after connecting, in order.
pub(crate) const SETUP_COMMANDS: &[&str] = &[
    "command -v bash >/dev/null 2>&1 && exec bash --norc --noprofile",
    "export TERM=dumb",
    "export NO_COLOR=1 CLICOLOR=0 LS_COLORS= GREP_COLORS=",
    "unalias -a 2>/dev/null; bind 'set enable-bracketed-paste off' 2>/dev/null",
    "unset PROMPT_COMMAND; PS1='__SSHSM_PROMPT__$ '; PS2=''",
];

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1B(?:",
        r"\[[0-?]*[ -/]*[@-~]",               // CSI
        r"|\][^\x07\x1B]*(?:\x07|\x1B\\)?",   // OSC
        r"|[PX^_][^\x1B]*(?:\x1B\\)?",        // DCS, SOS, PM, APC
        r"|[ -/]*[0-~]",                      // nF / Fp / Fe / Fs
        r")"
    ))
    .expect("ANSI escape pattern is valid")
});

/// Start/end markers delimiting one command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMarkers {
    pub start: String,
    pub end: String,
}

impl FrameMarkers {
    /// Fresh markers built from a random token.
    pub fn generate() -> Self {
        let token = Uuid::new_v4().simple().to_string();
        Self {
            start: format!("{MARKER_PREFIX}BEGIN_{token}__"),
            end: format!("{MARKER_PREFIX}END_{token}__"),
        }
    }
}

/// Build the composite line for `command`.
///
/// The status is stashed before the end marker is echoed, otherwise `$?`
/// would report the marker's own `echo`.
pub fn frame_command(command: &str, markers: &FrameMarkers) -> String {
    let body = command.trim().trim_end_matches(';').trim_end();
    let group = if body.is_empty() {
        "{ :; }".to_string()
    } else if body.ends_with('&') {
        format!("{{ {body} }}")
    } else {
        format!("{{ {body}; }}")
    };

    format!(
        "echo '{start}'; {group} 2>&1; {STATUS_VAR}=$?; echo '{end}'; echo \"{EXIT_CODE_TAG}${STATUS_VAR}\"",
        start = markers.start,
        end = markers.end,
    )
}

/// Remove terminal escape sequences and control characters.
///
/// Newlines and tabs survive, carriage returns do not, so `\r\n` line ends
/// come out as `\n`.
pub fn strip_ansi_codes(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    ANSI_ESCAPE
        .replace_all(text, "")
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Text strictly between the second start marker and the second end marker.
///
/// Returns an empty string when any of the four occurrences is missing.
pub fn extract_command_output(buffer: &str, markers: &FrameMarkers) -> String {
    let find_from = |needle: &str, from: usize| buffer[from..].find(needle).map(|i| from + i);

    let Some(first_start) = find_from(markers.start.as_str(), 0) else {
        return String::new();
    };
    let Some(first_end) = find_from(markers.end.as_str(), first_start + markers.start.len()) else {
        return String::new();
    };
    let Some(second_start) = find_from(markers.start.as_str(), first_end + markers.end.len()) else {
        return String::new();
    };
    let output_from = second_start + markers.start.len();
    let Some(second_end) = find_from(markers.end.as_str(), output_from) else {
        return String::new();
    };

    buffer[output_from..second_end].trim().to_string()
}

/// Text following the exit status tag, if the tag comes right after the
/// second end marker.
///
/// The first end marker belongs to the echoed command line, and the command
/// text or its output may contain the tag too; neither is trusted.
fn status_after_output<'a>(buffer: &'a str, markers: &FrameMarkers) -> Option<&'a str> {
    let (second_end, _) = buffer.match_indices(markers.end.as_str()).nth(1)?;
    let after = &buffer[second_end + markers.end.len()..];
    after
        .trim_start_matches(|c: char| c.is_whitespace() || c.is_control())
        .strip_prefix(EXIT_CODE_TAG)
}

/// Exit status echoed after the command's output, or `-1`.
pub fn parse_exit_code(buffer: &str, markers: &FrameMarkers) -> i32 {
    status_after_output(buffer, markers)
        .map(leading_integer)
        .filter(|digits| !digits.is_empty())
        .and_then(|digits| digits.parse::<i32>().ok())
        .unwrap_or(UNKNOWN_EXIT_CODE)
}

/// True once the exit status behind the output has fully arrived (tag,
/// digits, terminator).
pub(crate) fn has_exit_status(buffer: &str, markers: &FrameMarkers) -> bool {
    status_after_output(buffer, markers).is_some_and(|rest| {
        let digits = leading_integer(rest);
        !digits.is_empty() && rest.len() > digits.len()
    })
}

/// Optional minus sign followed by ASCII digits, or `""`.
fn leading_integer(text: &str) -> &str {
    let sign = usize::from(text.starts_with('-'));
    let digits = text[sign..]
        .bytes()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits == 0 { "" } else { &text[..sign + digits] }
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// What a poll-read loop is waiting for.
enum Awaiting<'a> {
    Marker(&'a str),
    ExitStatus(&'a FrameMarkers),
}

impl Awaiting<'_> {
    fn label(&self) -> &'static str {
        match self {
            Awaiting::Marker(_) => "shell initialization marker",
            Awaiting::ExitStatus(_) => "command exit status",
        }
    }

    /// `scan_from` is where text that was already checked ends, minus some
    /// overlap for a marker split across chunks.
    fn is_satisfied(&self, buffer: &str, scan_from: usize) -> bool {
        match self {
            Awaiting::Marker(marker) => buffer[scan_from..].contains(*marker),
            // Needs the marker count from the start of the buffer.
            Awaiting::ExitStatus(markers) => has_exit_status(buffer, markers),
        }
    }
}

/// Drives initialization and framed execution over a [`ShellStream`].
#[derive(Debug, Clone, Default)]
pub struct ShellProtocol {
    settings: ProtocolSettings,
}

impl ShellProtocol {
    pub fn new(settings: ProtocolSettings) -> Self {
        Self { settings }
    }

    /// Put the remote shell into a predictable state.
    ///
    /// Fails with `Timeout` if the ready marker does not come back within
    /// the init timeout.
    pub async fn initialize(
        &self,
        stream: &mut dyn ShellStream,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        for line in SETUP_COMMANDS {
            stream.write_line(line).await?;
            stream.flush().await?;
            if !self.settings.setup_delay.is_zero() {
                tokio::time::sleep(self.settings.setup_delay).await;
            }
        }

        let token = Uuid::new_v4().simple().to_string();
        let marker = format!("{MARKER_PREFIX}READY_{token}__");
        // Split quoting keeps the typed echo from matching the marker.
        stream
            .write_line(&format!("echo '{MARKER_PREFIX}READY_''{token}__'"))
            .await?;
        stream.flush().await?;

        self.read_until(
            stream,
            Awaiting::Marker(&marker),
            self.settings.init_timeout,
            cancel,
        )
        .await?;

        info!("Remote shell initialized");
        Ok(())
    }

    /// Run one command and parse its output and exit status.
    ///
    /// The caller must hold the session's stream exclusively for the whole
    /// call. A timeout or cancellation leaves the stream usable.
    pub async fn execute(
        &self,
        stream: &mut dyn ShellStream,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, SessionError> {
        let stale = self.drain_stale(stream)?;
        if stale > 0 {
            debug!("Discarded {} stale bytes before framing command", stale);
        }

        let markers = FrameMarkers::generate();
        stream.write_line(&frame_command(command, &markers)).await?;
        stream.flush().await?;

        let raw = self
            .read_until(
                stream,
                Awaiting::ExitStatus(&markers),
                self.settings.command_timeout,
                cancel,
            )
            .await?;

        let cleaned = strip_ansi_codes(&raw);
        let output = extract_command_output(&cleaned, &markers);
        let exit_code = parse_exit_code(&cleaned, &markers);

        if cleaned.matches(markers.end.as_str()).count() < 2 {
            warn!("Command markers incomplete; recording empty output");
        }
        debug!(
            "Command finished with exit code {} ({} raw bytes, {} output bytes)",
            exit_code,
            raw.len(),
            output.len()
        );

        Ok(CommandOutput {
            output,
            error_output: String::new(),
            exit_code,
        })
    }

    /// Drop whatever is already pending on the stream.
    fn drain_stale(&self, stream: &mut dyn ShellStream) -> Result<usize, SessionError> {
        let mut discarded = 0;
        while stream.data_available()? {
            let chunk = stream.read()?;
            if chunk.is_empty() {
                break;
            }
            discarded += chunk.len();
        }
        Ok(discarded)
    }

    /// Poll-read until `awaiting` is satisfied, the timeout elapses, or the
    /// token fires.
    async fn read_until(
        &self,
        stream: &mut dyn ShellStream,
        awaiting: Awaiting<'_>,
        timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<String, SessionError> {
        let waiting_for = awaiting.label();
        let started = Instant::now();
        let deadline = started + timeout;
        let mut buffer = String::new();

        loop {
            if cancel.is_cancelled() {
                warn!("Cancelled while waiting for {}", waiting_for);
                return Err(SessionError::Cancelled { waiting_for });
            }
            if Instant::now() >= deadline {
                warn!(
                    "Timed out after {:?} waiting for {} ({} bytes buffered)",
                    timeout,
                    waiting_for,
                    buffer.len()
                );
                return Err(SessionError::Timeout {
                    waiting_for,
                    elapsed: started.elapsed(),
                });
            }

            if stream.data_available()? {
                let chunk = stream.read()?;
                // Empty reads fall through to the wait.
                if !chunk.is_empty() {
                    let scan_from = floor_char_boundary(
                        &buffer,
                        buffer.len().saturating_sub(TAIL_OVERLAP),
                    );
                    buffer.push_str(&chunk);
                    if awaiting.is_satisfied(&buffer, scan_from) {
                        return Ok(buffer);
                    }
                    continue;
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}
