//! Scripted in-process shell used by unit tests.
//!
//! [`FakeShell`] emulates the remote side of a pseudo-terminal: every typed
//! line is echoed back, framed commands are answered with markers and an
//! exit status, and the order of writes and completed reads is recorded so
//! tests can check that commands never interleave on one stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::config::PtySettings;
use super::error::SessionError;
use super::protocol::{EXIT_CODE_TAG, SHELL_PROMPT};
use super::transport::{ShellStream, ShellTransport, TransportConnector};
use super::types::HostConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ShellEvent {
    /// A framed command was written.
    Write(String),
    /// The chunk carrying a command's exit status was read.
    Completed(String),
}

struct Chunk {
    ready_at: Instant,
    text: String,
    completes: Option<String>,
}

#[derive(Default)]
struct ShellState {
    pending: VecDeque<Chunk>,
    written: Vec<String>,
    events: Vec<ShellEvent>,
    latency: Duration,
    /// Piece size and spacing when replies trickle in.
    split: Option<(usize, Duration)>,
    /// Commands that never finish, on top of `hang`.
    stalled: Vec<String>,
    silent: bool,
    broken: bool,
    closed_streams: usize,
}

/// Remote shell emulator shared by every stream opened on it.
#[derive(Clone, Default)]
pub(crate) struct FakeShell {
    state: Arc<StdMutex<ShellState>>,
}

impl FakeShell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Delay before responses become readable.
    pub(crate) fn with_latency(latency: Duration) -> Self {
        let shell = Self::new();
        shell.state.lock().unwrap().latency = latency;
        shell
    }

    /// Echo typed lines at once, then deliver each framed reply in
    /// `piece`-character fragments, one every `step`.
    pub(crate) fn chunked(piece: usize, step: Duration) -> Self {
        let shell = Self::new();
        shell.state.lock().unwrap().split = Some((piece.max(1), step));
        shell
    }

    /// Never answer `command`.
    pub(crate) fn stall(&self, command: &str) {
        self.state.lock().unwrap().stalled.push(command.to_string());
    }

    /// Swallow every line without echoing or answering.
    pub(crate) fn set_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    /// Make every further write and read fail like a dropped connection.
    pub(crate) fn break_pipe(&self) {
        self.state.lock().unwrap().broken = true;
    }

    /// Queue raw output as if the remote side printed it unprompted.
    pub(crate) fn push_output(&self, text: &str) {
        self.state.lock().unwrap().pending.push_back(Chunk {
            ready_at: Instant::now(),
            text: text.to_string(),
            completes: None,
        });
    }

    /// Fresh shell with the same latency and failure switches.
    pub(crate) fn fork(&self) -> Self {
        let state = self.state.lock().unwrap();
        Self {
            state: Arc::new(StdMutex::new(ShellState {
                latency: state.latency,
                split: state.split,
                stalled: state.stalled.clone(),
                silent: state.silent,
                broken: state.broken,
                ..ShellState::default()
            })),
        }
    }

    pub(crate) fn written(&self) -> Vec<String> {
        self.state.lock().unwrap().written.clone()
    }

    pub(crate) fn events(&self) -> Vec<ShellEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub(crate) fn closed_streams(&self) -> usize {
        self.state.lock().unwrap().closed_streams
    }

    fn receive_line(&self, line: &str) {
        let mut state = self.state.lock().unwrap();
        state.written.push(line.to_string());
        if state.silent {
            return;
        }

        let ready_at = Instant::now() + state.latency;
        let echo = format!("{line}\r\n");

        match parse_framed(line) {
            Some(framed) => {
                state.events.push(ShellEvent::Write(framed.command.clone()));
                let answer = if state.stalled.contains(&framed.command) {
                    None
                } else {
                    respond(&framed.command)
                };
                let reply = answer.map(|(output, code)| {
                    let body = if output.is_empty() {
                        String::new()
                    } else {
                        format!("{output}\r\n")
                    };
                    format!(
                        "{start}\r\n{body}{end}\r\n{EXIT_CODE_TAG}{code}\r\n{SHELL_PROMPT}",
                        start = framed.start,
                        end = framed.end,
                    )
                });
                let completes = reply.as_ref().map(|_| framed.command.clone());
                match (state.split, reply) {
                    (Some((piece, step)), Some(reply)) => {
                        state.pending.push_back(Chunk {
                            ready_at,
                            text: echo,
                            completes: None,
                        });
                        let pieces = split_pieces(&reply, piece);
                        let last = pieces.len() - 1;
                        for (i, text) in pieces.into_iter().enumerate() {
                            state.pending.push_back(Chunk {
                                ready_at: ready_at + step * (i as u32 + 1),
                                text,
                                completes: if i == last { completes.clone() } else { None },
                            });
                        }
                    }
                    (_, reply) => state.pending.push_back(Chunk {
                        ready_at,
                        text: format!("{echo}{}", reply.unwrap_or_default()),
                        completes,
                    }),
                }
            }
            None => {
                // `echo 'a''b'` prints `ab`; anything else just gets a prompt.
                let printed = line
                    .strip_prefix("echo ")
                    .map(|rest| format!("{}\r\n", rest.replace('\'', "")))
                    .unwrap_or_default();
                state.pending.push_back(Chunk {
                    ready_at,
                    text: format!("{echo}{printed}{SHELL_PROMPT}"),
                    completes: None,
                });
            }
        }
    }
}

struct Framed {
    start: String,
    end: String,
    command: String,
}

fn parse_framed(line: &str) -> Option<Framed> {
    let rest = line.strip_prefix("echo '")?;
    let (start, rest) = rest.split_once("'; { ")?;
    let (group, rest) = rest.split_once(" } 2>&1; __sshsm_rc=$?; echo '")?;
    let (end, _) = rest.split_once("'; echo")?;
    let command = group.trim_end_matches(';').trim().to_string();
    Some(Framed {
        start: start.to_string(),
        end: end.to_string(),
        command,
    })
}

fn split_pieces(text: &str, piece: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(piece)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Canned answers. `None` means the command never finishes.
fn respond(command: &str) -> Option<(String, i32)> {
    // Only the trailing `printf '...'` produces output.
    if let Some((_, format)) = command.split_once("printf '") {
        let printed = format.trim_end_matches('\'').replace("\\n", "\r\n");
        return Some((printed.trim_end().to_string(), 0));
    }
    match command {
        "hang" => None,
        "pwd" => Some(("/home/tester".to_string(), 0)),
        "false" => Some((String::new(), 1)),
        "ls --color" => Some(("\x1b[01;34mdir\x1b[0m\r\nfile.txt".to_string(), 0)),
        other => match other.strip_prefix("echo ") {
            Some(text) => Some((text.to_string(), 0)),
            None => Some((format!("bash: {other}: command not found"), 127)),
        },
    }
}

pub(crate) struct FakeStream {
    shell: FakeShell,
    closed: bool,
}

impl FakeStream {
    pub(crate) fn new(shell: FakeShell) -> Self {
        Self {
            shell,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<(), SessionError> {
        if self.closed || self.shell.state.lock().unwrap().broken {
            return Err(SessionError::connection("shell channel closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl ShellStream for FakeStream {
    async fn write_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.check_open()?;
        self.shell.receive_line(line);
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SessionError> {
        self.check_open()
    }

    fn data_available(&mut self) -> Result<bool, SessionError> {
        self.check_open()?;
        let state = self.shell.state.lock().unwrap();
        Ok(state
            .pending
            .front()
            .is_some_and(|chunk| chunk.ready_at <= Instant::now()))
    }

    fn read(&mut self) -> Result<String, SessionError> {
        self.check_open()?;
        let mut state = self.shell.state.lock().unwrap();
        let now = Instant::now();
        let mut out = String::new();
        while state
            .pending
            .front()
            .is_some_and(|chunk| chunk.ready_at <= now)
        {
            if let Some(chunk) = state.pending.pop_front() {
                out.push_str(&chunk.text);
                if let Some(command) = chunk.completes {
                    state.events.push(ShellEvent::Completed(command));
                }
            }
        }
        Ok(out)
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.shell.state.lock().unwrap().closed_streams += 1;
        }
        Ok(())
    }
}

/// Transport handing out [`FakeStream`]s over one [`FakeShell`].
pub(crate) struct FakeTransport {
    pub(crate) shell: FakeShell,
    connected: AtomicBool,
    disconnects: AtomicUsize,
    fail_disconnect: bool,
    fail_stream: bool,
}

impl FakeTransport {
    pub(crate) fn new(shell: FakeShell) -> Self {
        Self {
            shell,
            connected: AtomicBool::new(true),
            disconnects: AtomicUsize::new(0),
            fail_disconnect: false,
            fail_stream: false,
        }
    }

    pub(crate) fn failing_disconnect(shell: FakeShell) -> Self {
        Self {
            fail_disconnect: true,
            ..Self::new(shell)
        }
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellTransport for FakeTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn create_shell_stream(
        &self,
        _pty: &PtySettings,
    ) -> Result<Box<dyn ShellStream>, SessionError> {
        if self.fail_stream {
            return Err(SessionError::connection("channel open refused"));
        }
        Ok(Box::new(FakeStream::new(self.shell.clone())))
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.fail_disconnect {
            return Err(SessionError::connection("disconnect failed"));
        }
        Ok(())
    }
}

/// How [`FakeConnector`] treats connect requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectBehavior {
    Accept,
    Refuse,
    /// Connect, but refuse to open a shell channel.
    NoShell,
}

/// Connector that records every transport it hands out.
///
/// Each connection gets its own fork of the template shell.
pub(crate) struct FakeConnector {
    shell: FakeShell,
    behavior: ConnectBehavior,
    transports: StdMutex<Vec<Arc<FakeTransport>>>,
}

impl FakeConnector {
    pub(crate) fn new(shell: FakeShell) -> Self {
        Self::with_behavior(shell, ConnectBehavior::Accept)
    }

    pub(crate) fn with_behavior(shell: FakeShell, behavior: ConnectBehavior) -> Self {
        Self {
            shell,
            behavior,
            transports: StdMutex::new(Vec::new()),
        }
    }

    pub(crate) fn transports(&self) -> Vec<Arc<FakeTransport>> {
        self.transports.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, host: &HostConfig) -> Result<Arc<dyn ShellTransport>, SessionError> {
        if self.behavior == ConnectBehavior::Refuse {
            return Err(SessionError::connection(format!(
                "Failed to connect to {}: Connection refused",
                host.address()
            )));
        }
        let transport = Arc::new(FakeTransport {
            fail_stream: self.behavior == ConnectBehavior::NoShell,
            ..FakeTransport::new(self.shell.fork())
        });
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}
