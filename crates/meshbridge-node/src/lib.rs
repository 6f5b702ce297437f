//! Meshbridge Node -- gateway and client roles over the radio mesh.
//!
//! The dispatcher task owns all per-message state (reassembly, chunk cache,
//! pending sends, correlation waiters); the outbox and dedupe cache are
//! injected long-lived resources. A single reader loop feeds frames in, a
//! writer task drains frames out, and a 1 s sweeper drives every timer.

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod gateway;
pub mod metrics;
pub mod radio;
pub mod status_api;
pub mod transport;

pub use client::Client;
pub use dispatcher::{Dispatcher, InboundRequest};
pub use gateway::{CommandExecutor, Gateway, HttpExecutor};
pub use radio::{LossPolicy, Radio, RadioError, SimBus};

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("timeout waiting for response to {message_id}")]
    Timeout { message_id: String },
    #[error(transparent)]
    Protocol(#[from] meshbridge_protocol::ProtocolError),
    #[error(transparent)]
    Spool(#[from] meshbridge_spool::SpoolError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("duplicate request with divergent payload: {message_id}")]
    DedupeConflict { message_id: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("configuration error: {0}")]
    Config(String),
}
