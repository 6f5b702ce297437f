//! Application-level message envelope.
//!
//! One envelope per logical request/response. Retries MUST reuse the same
//! `id`: the gateway dedupes on it and correlation depends on it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Default priority. Lower is more urgent (0 = critical, 10 = normal).
pub const DEFAULT_PRIORITY: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Request,
    Response,
    Error,
    Ack,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Error => "error",
            EnvelopeKind::Ack => "ack",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "request" => Ok(EnvelopeKind::Request),
            "response" => Ok(EnvelopeKind::Response),
            "error" => Ok(EnvelopeKind::Error),
            "ack" => Ok(EnvelopeKind::Ack),
            other => Err(format!("unknown envelope type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Operation name, snake_case. Required for requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// For response/error/ack: the `id` of the triggering request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

impl Envelope {
    pub fn request(id: impl Into<String>, command: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            kind: EnvelopeKind::Request,
            command: Some(command.into()),
            priority: DEFAULT_PRIORITY,
            correlation_id: None,
            data,
            meta: Map::new(),
        }
    }

    pub fn response(
        id: impl Into<String>,
        correlation_id: impl Into<String>,
        command: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            id: id.into(),
            kind: EnvelopeKind::Response,
            command,
            priority: DEFAULT_PRIORITY,
            correlation_id: Some(correlation_id.into()),
            data,
            meta: Map::new(),
        }
    }

    pub fn error(
        id: impl Into<String>,
        correlation_id: impl Into<String>,
        command: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: EnvelopeKind::Error,
            command,
            priority: DEFAULT_PRIORITY,
            correlation_id: Some(correlation_id.into()),
            data: serde_json::json!({ "error": message.into() }),
            meta: Map::new(),
        }
    }

    /// An `ack` carries only its own id and the acked envelope's id.
    /// It is consumed by the outbox and never reaches application handlers.
    pub fn ack(id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: EnvelopeKind::Ack,
            command: None,
            priority: 0, // acks jump the queue
            correlation_id: Some(correlation_id.into()),
            data: Value::Null,
            meta: Map::new(),
        }
    }

    /// 8-byte chunk-header prefix: leading UTF-8 bytes of `id`, zero-padded.
    pub fn prefix(&self) -> crate::frame::IdPrefix {
        crate::frame::id_prefix(&self.id)
    }
}
