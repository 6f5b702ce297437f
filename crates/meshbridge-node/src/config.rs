//! Configuration types for the bridge node.
//! Parsed from ~/.meshbridge/config.toml; every knob has a sane default.

use std::path::Path;
use std::time::Duration;

use meshbridge_reliability::{DedupeConfig, ReassemblyConfig, ReliabilityMethod};
use serde::{Deserialize, Serialize};

use crate::client::ClientConfig;
use crate::dispatcher::DispatcherConfig;
use crate::NodeError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub reliability: ReliabilitySection,
    #[serde(default)]
    pub spool: SpoolSection,
    #[serde(default)]
    pub dedupe: DedupeSection,
    #[serde(default)]
    pub status: StatusSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// This node's mesh identifier.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    /// The gateway every client talks to.
    #[serde(default = "default_gateway_node_id")]
    pub gateway_node_id: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Bearer token for the HTTP API. The CLI may fill this from
    /// ATLAS_API_TOKEN; the core never reads the environment itself.
    pub api_token: Option<String>,
    /// Use the in-process simulated radio instead of hardware.
    #[serde(default)]
    pub simulate: bool,
    /// Serial port of the attached radio (requires the `serial` feature).
    pub radio_port: Option<String>,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            gateway_node_id: default_gateway_node_id(),
            api_base_url: default_api_base_url(),
            api_token: None,
            simulate: false,
            radio_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// Outgoing chunk body ceiling in bytes.
    #[serde(default = "default_segment_size")]
    pub segment_size: usize,
    /// Pace trains at or above this many chunks. Absent = no pacing.
    #[serde(default)]
    pub chunk_delay_threshold: Option<u16>,
    #[serde(default)]
    pub chunk_delay_seconds: f64,
    /// Progress-resetting timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    /// Absolute cap on one send's wait, seconds.
    #[serde(default = "default_post_response_timeout")]
    pub post_response_timeout: f64,
    /// Quiet window after a train before the first probe, seconds.
    #[serde(default = "default_post_response_quiet")]
    pub post_response_quiet: f64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            segment_size: default_segment_size(),
            chunk_delay_threshold: None,
            chunk_delay_seconds: 0.0,
            timeout: default_timeout(),
            post_response_timeout: default_post_response_timeout(),
            post_response_quiet: default_post_response_quiet(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilitySection {
    /// simple | stage | window | window_fec
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_nack_max_per_seq")]
    pub nack_max_per_seq: u32,
    #[serde(default = "default_nack_interval")]
    pub nack_interval: f64,
}

impl Default for ReliabilitySection {
    fn default() -> Self {
        Self {
            method: default_method(),
            nack_max_per_seq: default_nack_max_per_seq(),
            nack_interval: default_nack_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolSection {
    #[serde(default = "default_spool_path")]
    pub spool_path: String,
    #[serde(default)]
    pub clear_spool: bool,
    /// Retries after the initial transmission.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for SpoolSection {
    fn default() -> Self {
        Self {
            spool_path: default_spool_path(),
            clear_spool: false,
            retries: default_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeSection {
    #[serde(default = "default_dedupe_ttl")]
    pub dedupe_ttl_seconds: u64,
    /// Also index responses by command+data hash to catch retries that
    /// mutate the request id.
    #[serde(default)]
    pub semantic_fingerprint: bool,
}

impl Default for DedupeSection {
    fn default() -> Self {
        Self {
            dedupe_ttl_seconds: default_dedupe_ttl(),
            semantic_fingerprint: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatusSection {
    /// Bind address for the status API, e.g. "127.0.0.1:9700". Absent = off.
    pub status_addr: Option<String>,
}

// Default value functions
fn default_node_id() -> String {
    "node-0".into()
}
fn default_gateway_node_id() -> String {
    "gateway".into()
}
fn default_api_base_url() -> String {
    "http://127.0.0.1:8787".into()
}
fn default_segment_size() -> usize {
    meshbridge_protocol::SEGMENT_SIZE
}
fn default_timeout() -> f64 {
    90.0
}
fn default_post_response_timeout() -> f64 {
    150.0
}
fn default_post_response_quiet() -> f64 {
    10.0
}
fn default_method() -> String {
    "window".into()
}
fn default_nack_max_per_seq() -> u32 {
    3
}
fn default_nack_interval() -> f64 {
    1.0
}
fn default_spool_path() -> String {
    "~/.meshbridge/outbox.json".into()
}
fn default_retries() -> u32 {
    2
}
fn default_dedupe_ttl() -> u64 {
    3600
}

impl BridgeConfig {
    /// Load config from file, or fall back to defaults if it is missing.
    pub fn load_or_default(path: &Path) -> Result<Self, NodeError> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))?;
            toml::from_str(&content)
                .map_err(|e| NodeError::Config(format!("{}: {e}", path.display())))
        } else {
            Ok(Self::default())
        }
    }

    pub fn method(&self) -> Result<ReliabilityMethod, NodeError> {
        self.reliability
            .method
            .parse()
            .map_err(NodeError::Config)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            node_id: self.node.node_id.clone(),
            segment_size: self
                .transport
                .segment_size
                .min(meshbridge_protocol::MAX_CHUNK_SIZE - meshbridge_protocol::HEADER_SIZE),
            chunk_delay_threshold: self.transport.chunk_delay_threshold,
            chunk_delay: Duration::from_secs_f64(self.transport.chunk_delay_seconds.max(0.0)),
            timeout: Duration::from_secs_f64(self.transport.timeout),
            absolute_timeout: Duration::from_secs_f64(self.transport.post_response_timeout),
            quiet_period: Duration::from_secs_f64(self.transport.post_response_quiet),
        }
    }

    pub fn reassembly_config(&self) -> ReassemblyConfig {
        ReassemblyConfig {
            nack_max_per_seq: self.reliability.nack_max_per_seq,
            nack_interval: Duration::from_secs_f64(self.reliability.nack_interval.max(0.0)),
            ..ReassemblyConfig::default()
        }
    }

    pub fn dedupe_config(&self) -> DedupeConfig {
        DedupeConfig {
            ttl: Duration::from_secs(self.dedupe.dedupe_ttl_seconds),
            semantic: self.dedupe.semantic_fingerprint,
            ..DedupeConfig::default()
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            gateway_node_id: self.node.gateway_node_id.clone(),
            timeout: Duration::from_secs_f64(self.transport.timeout),
            absolute_timeout: Duration::from_secs_f64(self.transport.post_response_timeout),
        }
    }
}
