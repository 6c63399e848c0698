//! Interactive SSH shell sessions.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: Domain records and HTTP request/response types
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Session errors and connect retry classification
//! - `transport`: Connector, transport and shell stream traits
//! - `auth`: Authentication strategies for the russh client
//! - `client`: russh connection setup with retry
//! - `shell`: russh-backed transport and PTY shell stream
//! - `protocol`: Shell initialization, command framing and output parsing
//! - `registry`: Live session bookkeeping
//! - `store`: Persistence collaborator
//! - `service`: Session orchestration
//! - `api`: `poem` routes

pub mod api;
pub(crate) mod auth;
pub(crate) mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod service;
pub mod shell;
pub mod store;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{ApiState, routes};
pub use config::ServiceConfig;
pub use error::SessionError;
pub use service::SessionService;
pub use shell::RusshConnector;
pub use store::{InMemorySessionStore, SessionStore};
