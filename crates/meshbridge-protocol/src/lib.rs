//! Meshbridge Protocol -- wire types, envelope codec, chunk framing.
//!
//! On-air unit is a chunk: 16-byte binary header + opaque body, at most
//! 230 bytes total. Envelopes ride inside chunk bodies as key-aliased
//! MessagePack compressed with zstd.

pub mod codec;
pub mod envelope;
pub mod frame;

pub use codec::{decode_envelope, encode_envelope};
pub use envelope::{Envelope, EnvelopeKind};
pub use frame::{ChunkHeader, ControlMsg, IdPrefix};

/// Chunk header magic: `MB`.
pub const MAGIC: [u8; 2] = *b"MB";

/// Chunk header version.
pub const VERSION: u8 = 1;

/// Control flag: chunk body is an ACK-layer control string.
pub const FLAG_ACK: u8 = 0x01;

/// Control flag: chunk body is a missing-sequence bitmap.
pub const FLAG_NACK: u8 = 0x02;

/// Fixed chunk header size in bytes.
pub const HEADER_SIZE: usize = 16;

/// Default chunk body ceiling. With the 16-byte header this yields
/// 226-byte frames, leaving a margin under the radio packet limit.
pub const SEGMENT_SIZE: usize = 210;

/// Hard ceiling for a whole on-air frame (header + body).
pub const MAX_CHUNK_SIZE: usize = 230;

/// Hard ceiling for an encoded envelope. Larger transfers belong on the
/// HTTP API, not the mesh.
pub const MAX_ENVELOPE_BYTES: usize = 10 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}
