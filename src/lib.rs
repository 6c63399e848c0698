//! SSH shell session manager.
//!
//! Keeps interactive pseudo-terminal shells open on remote hosts and runs
//! commands through them, framing each command with unique markers so its
//! output and exit status can be recovered from the raw terminal stream.

pub mod ssh;
