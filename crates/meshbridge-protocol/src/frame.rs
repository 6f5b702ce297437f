//! Chunk framing: 16-byte header, control strings, NACK bitmaps.
//!
//! Header layout (network byte order):
//! magic `MB` (2) | version (1) | flags (1) | id prefix (8) | seq u16 | total u16
//!
//! The id prefix is an opaque 8-byte key; collisions are resolved by pairing
//! it with the sender node id in reassembly.

use bytes::{Buf, BufMut};

use crate::{ProtocolError, FLAG_ACK, FLAG_NACK, HEADER_SIZE, MAGIC, MAX_CHUNK_SIZE, VERSION};

/// First 8 UTF-8 bytes of an envelope id, right-padded with zeros.
pub type IdPrefix = [u8; 8];

/// Derive the chunk-header prefix for an envelope id.
pub fn id_prefix(id: &str) -> IdPrefix {
    let mut prefix = [0u8; 8];
    let bytes = id.as_bytes();
    let n = bytes.len().min(8);
    prefix[..n].copy_from_slice(&bytes[..n]);
    prefix
}

/// Render a prefix for log output (trailing zeros trimmed, lossy UTF-8).
pub fn prefix_str(prefix: &IdPrefix) -> String {
    let end = prefix.iter().position(|b| *b == 0).unwrap_or(8);
    String::from_utf8_lossy(&prefix[..end]).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub flags: u8,
    pub prefix: IdPrefix,
    /// 1-based sequence number.
    pub seq: u16,
    pub total: u16,
}

impl ChunkHeader {
    pub fn is_control(&self) -> bool {
        self.flags & (FLAG_ACK | FLAG_NACK) != 0
    }
}

/// Serialize a header + body into one on-air frame.
pub fn encode_chunk(header: &ChunkHeader, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let size = HEADER_SIZE + body.len();
    if size > MAX_CHUNK_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_CHUNK_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(size);
    frame.put_slice(&MAGIC);
    frame.put_u8(VERSION);
    frame.put_u8(header.flags);
    frame.put_slice(&header.prefix);
    frame.put_u16(header.seq);
    frame.put_u16(header.total);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Parse a frame into header + body. Body length is frame length minus 16;
/// there is no inner length field.
pub fn parse_chunk(frame: &[u8]) -> Result<(ChunkHeader, &[u8]), ProtocolError> {
    if frame.len() < HEADER_SIZE {
        return Err(ProtocolError::InvalidFrame(format!(
            "frame too small: {} bytes",
            frame.len()
        )));
    }
    let mut buf = &frame[..HEADER_SIZE];
    let mut magic = [0u8; 2];
    buf.copy_to_slice(&mut magic);
    if magic != MAGIC {
        return Err(ProtocolError::InvalidFrame(format!(
            "bad magic: {:02x}{:02x}",
            magic[0], magic[1]
        )));
    }
    let version = buf.get_u8();
    if version != VERSION {
        return Err(ProtocolError::InvalidFrame(format!(
            "unsupported version: {version}"
        )));
    }
    let flags = buf.get_u8();
    if flags & !(FLAG_ACK | FLAG_NACK) != 0 {
        return Err(ProtocolError::InvalidFrame(format!(
            "unknown flags: {flags:#04x}"
        )));
    }
    let mut prefix = [0u8; 8];
    buf.copy_to_slice(&mut prefix);
    let seq = buf.get_u16();
    let total = buf.get_u16();

    Ok((
        ChunkHeader {
            flags,
            prefix,
            seq,
            total,
        },
        &frame[HEADER_SIZE..],
    ))
}

/// Split an encoded envelope into data chunk frames.
pub fn chunk_payload(
    encoded: &[u8],
    id: &str,
    segment_size: usize,
) -> Result<Vec<Vec<u8>>, ProtocolError> {
    if encoded.is_empty() {
        return Ok(Vec::new());
    }
    let total = encoded.len().div_ceil(segment_size);
    if total > u16::MAX as usize {
        return Err(ProtocolError::PayloadTooLarge {
            size: encoded.len(),
            max: segment_size * u16::MAX as usize,
        });
    }
    let prefix = id_prefix(id);
    let mut chunks = Vec::with_capacity(total);
    for (index, segment) in encoded.chunks(segment_size).enumerate() {
        let header = ChunkHeader {
            flags: 0,
            prefix,
            seq: (index + 1) as u16,
            total: total as u16,
        };
        chunks.push(encode_chunk(&header, segment)?);
    }
    Ok(chunks)
}

// ============================================================================
// Control strings
// ============================================================================

/// Chunk-layer control message, carried in a chunk body with the ACK flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    /// Receiver confirms full reassembly of a message.
    AllReceived { message_id: String },
    /// Sender asks the receiver for a missing-chunk bitmap.
    BitmapReq { message_id: String },
    /// Staged mode: sender announces an upcoming train of `total` chunks.
    Announce { message_id: String, total: u16 },
    /// Staged mode: receiver acknowledges an announce.
    AnnounceAck { message_id: String },
    /// Staged mode: sender reports the train finished; receiver must reply
    /// with a bitmap or all_received.
    Complete { message_id: String },
}

impl ControlMsg {
    pub fn message_id(&self) -> &str {
        match self {
            ControlMsg::AllReceived { message_id }
            | ControlMsg::BitmapReq { message_id }
            | ControlMsg::Announce { message_id, .. }
            | ControlMsg::AnnounceAck { message_id }
            | ControlMsg::Complete { message_id } => message_id,
        }
    }

    pub fn render(&self) -> String {
        match self {
            ControlMsg::AllReceived { message_id } => format!("all_received|{message_id}"),
            ControlMsg::BitmapReq { message_id } => format!("bitmap_req|{message_id}"),
            ControlMsg::Announce { message_id, total } => {
                format!("announce|{message_id}|{total}")
            }
            ControlMsg::AnnounceAck { message_id } => format!("announce_ack|{message_id}"),
            ControlMsg::Complete { message_id } => format!("complete|{message_id}"),
        }
    }

    pub fn parse(body: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(body).ok()?;
        let (verb, rest) = text.split_once('|')?;
        match verb {
            "all_received" => Some(ControlMsg::AllReceived {
                message_id: rest.to_owned(),
            }),
            "bitmap_req" => Some(ControlMsg::BitmapReq {
                message_id: rest.to_owned(),
            }),
            "announce" => {
                let (message_id, total) = rest.split_once('|')?;
                Some(ControlMsg::Announce {
                    message_id: message_id.to_owned(),
                    total: total.parse().ok()?,
                })
            }
            "announce_ack" => Some(ControlMsg::AnnounceAck {
                message_id: rest.to_owned(),
            }),
            "complete" => Some(ControlMsg::Complete {
                message_id: rest.to_owned(),
            }),
            _ => None,
        }
    }
}

/// Build a control chunk (ACK flag, seq=1, total=1).
pub fn build_control_chunk(msg: &ControlMsg) -> Result<Vec<u8>, ProtocolError> {
    let header = ChunkHeader {
        flags: FLAG_ACK,
        prefix: id_prefix(msg.message_id()),
        seq: 1,
        total: 1,
    };
    encode_chunk(&header, msg.render().as_bytes())
}

// ============================================================================
// NACK bitmaps
// ============================================================================

/// Build a NACK chunk whose body is a missing-sequence bitmap.
///
/// The bitmap is `ceil(total/8)` bytes, little-endian bit order within each
/// byte: bit `i` set means sequence `i + 1` is missing.
pub fn build_nack_chunk(
    prefix: IdPrefix,
    total: u16,
    missing: &[u16],
) -> Result<Vec<u8>, ProtocolError> {
    let mut bitmap = vec![0u8; (total as usize).div_ceil(8)];
    for &seq in missing {
        if seq == 0 || seq > total {
            continue;
        }
        let bit = (seq - 1) as usize;
        bitmap[bit / 8] |= 1 << (bit % 8);
    }
    let header = ChunkHeader {
        flags: FLAG_NACK,
        prefix,
        seq: 1,
        total,
    };
    encode_chunk(&header, &bitmap)
}

/// Decode a NACK bitmap body into missing sequence numbers (ascending).
pub fn parse_nack_bitmap(body: &[u8], total: u16) -> Vec<u16> {
    let mut missing = Vec::new();
    for seq in 1..=total {
        let bit = (seq - 1) as usize;
        let Some(byte) = body.get(bit / 8) else {
            break;
        };
        if byte & (1 << (bit % 8)) != 0 {
            missing.push(seq);
        }
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_byte_layout() {
        // Normative vector: seq=3, total=6, no flags, id prefix "deadbeef01020304"
        // (hex) => 4D 42 01 00 DE AD BE EF 01 02 03 04 00 03 00 06.
        let header = ChunkHeader {
            flags: 0,
            prefix: [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04],
            seq: 3,
            total: 6,
        };
        let frame = encode_chunk(&header, b"").unwrap();
        assert_eq!(
            frame,
            [
                0x4D, 0x42, 0x01, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x00,
                0x03, 0x00, 0x06
            ]
        );
    }

    #[test]
    fn test_parse_roundtrip() {
        let header = ChunkHeader {
            flags: 0,
            prefix: id_prefix("aaaa-1111"),
            seq: 2,
            total: 5,
        };
        let frame = encode_chunk(&header, b"payload bytes").unwrap();
        let (parsed, body) = parse_chunk(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body, b"payload bytes");
    }

    #[test]
    fn test_parse_rejects_bad_magic_version_flags() {
        let header = ChunkHeader {
            flags: 0,
            prefix: [0; 8],
            seq: 1,
            total: 1,
        };
        let good = encode_chunk(&header, b"x").unwrap();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert!(parse_chunk(&bad_magic).is_err());

        let mut bad_version = good.clone();
        bad_version[2] = 9;
        assert!(parse_chunk(&bad_version).is_err());

        let mut bad_flags = good.clone();
        bad_flags[3] = 0x80;
        assert!(parse_chunk(&bad_flags).is_err());

        assert!(parse_chunk(&good[..10]).is_err());
    }

    #[test]
    fn test_id_prefix_truncates_and_pads() {
        assert_eq!(id_prefix("aaaa-1111"), *b"aaaa-111");
        assert_eq!(id_prefix("ab"), [b'a', b'b', 0, 0, 0, 0, 0, 0]);
        assert_eq!(prefix_str(&id_prefix("ab")), "ab");
    }

    #[test]
    fn test_chunk_payload_covers_input() {
        let encoded: Vec<u8> = (0..1180u32).map(|i| (i % 251) as u8).collect();
        let chunks = chunk_payload(&encoded, "msg-0001", 210).unwrap();
        assert_eq!(chunks.len(), 6);

        let mut reassembled = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.len() <= MAX_CHUNK_SIZE);
            let (header, body) = parse_chunk(chunk).unwrap();
            assert_eq!(header.seq as usize, i + 1);
            assert_eq!(header.total, 6);
            assert_eq!(header.prefix, id_prefix("msg-0001"));
            reassembled.extend_from_slice(body);
        }
        assert_eq!(reassembled, encoded);
    }

    #[test]
    fn test_oversize_frame_rejected() {
        let header = ChunkHeader {
            flags: 0,
            prefix: [0; 8],
            seq: 1,
            total: 1,
        };
        let body = vec![0u8; MAX_CHUNK_SIZE - HEADER_SIZE + 1];
        assert!(matches!(
            encode_chunk(&header, &body),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_control_msg_roundtrip() {
        let msgs = [
            ControlMsg::AllReceived {
                message_id: "aaaa-1111".into(),
            },
            ControlMsg::BitmapReq {
                message_id: "bbbb-2222".into(),
            },
            ControlMsg::Announce {
                message_id: "cccc".into(),
                total: 12,
            },
            ControlMsg::AnnounceAck {
                message_id: "cccc".into(),
            },
            ControlMsg::Complete {
                message_id: "cccc".into(),
            },
        ];
        for msg in msgs {
            let parsed = ControlMsg::parse(msg.render().as_bytes()).unwrap();
            assert_eq!(parsed, msg);
        }
        assert!(ControlMsg::parse(b"gibberish").is_none());
        assert!(ControlMsg::parse(b"announce|id|notanumber").is_none());
    }

    #[test]
    fn test_control_chunk_has_ack_flag() {
        let frame = build_control_chunk(&ControlMsg::BitmapReq {
            message_id: "aaaa-1111".into(),
        })
        .unwrap();
        let (header, body) = parse_chunk(&frame).unwrap();
        assert_eq!(header.flags, FLAG_ACK);
        assert_eq!(body, b"bitmap_req|aaaa-1111");
    }

    #[test]
    fn test_nack_bitmap_bit_order() {
        // Missing {3} of 6 => single byte 0b0000_0100.
        let frame = build_nack_chunk(id_prefix("msg-0001"), 6, &[3]).unwrap();
        let (header, body) = parse_chunk(&frame).unwrap();
        assert_eq!(header.flags, FLAG_NACK);
        assert_eq!(body, [0b0000_0100]);
        assert_eq!(parse_nack_bitmap(body, 6), vec![3]);
    }

    #[test]
    fn test_nack_bitmap_multi_byte() {
        let missing = vec![1, 8, 9, 16, 17];
        let frame = build_nack_chunk(id_prefix("m"), 20, &missing).unwrap();
        let (header, body) = parse_chunk(&frame).unwrap();
        assert_eq!(body.len(), 3); // ceil(20 / 8)
        assert_eq!(parse_nack_bitmap(body, header.total), missing);
    }

    #[test]
    fn test_nack_bitmap_complement_property() {
        // Bit i set iff sequence i+1 not in the received set.
        let total = 11u16;
        let received = [1u16, 2, 4, 7, 11];
        let missing: Vec<u16> = (1..=total).filter(|s| !received.contains(s)).collect();
        let frame = build_nack_chunk(id_prefix("m"), total, &missing).unwrap();
        let (_, body) = parse_chunk(&frame).unwrap();
        for seq in 1..=total {
            let bit = (seq - 1) as usize;
            let set = body[bit / 8] & (1 << (bit % 8)) != 0;
            assert_eq!(set, !received.contains(&seq), "sequence {seq}");
        }
    }

    #[test]
    fn test_nack_bitmap_ignores_out_of_range() {
        let frame = build_nack_chunk(id_prefix("m"), 4, &[0, 2, 9]).unwrap();
        let (_, body) = parse_chunk(&frame).unwrap();
        assert_eq!(parse_nack_bitmap(body, 4), vec![2]);
    }
}
