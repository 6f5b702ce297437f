//! Selective-repeat recovery strategies.
//!
//! Strategies never touch the radio. They return `ControlAction` values and
//! the transport executes them, so every strategy stays a pure state machine
//! over (frame, reassembly state).

use std::fmt;
use std::str::FromStr;

use meshbridge_protocol::frame::{parse_nack_bitmap, prefix_str, ChunkHeader, ControlMsg, IdPrefix};
use meshbridge_protocol::{FLAG_ACK, FLAG_NACK};

use crate::reassembly::Reassembler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReliabilityMethod {
    /// Single-shot: no chunk-layer recovery, end-to-end ack only.
    Simple,
    /// Announce -> chunks -> complete/repair handshake.
    Stage,
    /// Windowed selective repeat with bitmap requests (default).
    #[default]
    Window,
    /// Reserved: window wire format plus an opportunistic duplicate of the
    /// final chunk. No parity math yet.
    WindowFec,
}

impl ReliabilityMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReliabilityMethod::Simple => "simple",
            ReliabilityMethod::Stage => "stage",
            ReliabilityMethod::Window => "window",
            ReliabilityMethod::WindowFec => "window_fec",
        }
    }
}

impl fmt::Display for ReliabilityMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReliabilityMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(ReliabilityMethod::Simple),
            "stage" | "staged" => Ok(ReliabilityMethod::Stage),
            "window" | "selective" | "selective_repeat" => Ok(ReliabilityMethod::Window),
            "window_fec" | "window_parity" => Ok(ReliabilityMethod::WindowFec),
            other => Err(format!("unknown reliability method: {other}")),
        }
    }
}

/// I/O the transport should perform on behalf of the strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Send a control string chunk to a peer.
    Control { to: String, msg: ControlMsg },
    /// Send a NACK bitmap naming missing sequences.
    Nack {
        to: String,
        prefix: IdPrefix,
        total: u16,
        missing: Vec<u16>,
    },
    /// Resend cached chunks for the listed sequences.
    Resend {
        to: String,
        prefix: IdPrefix,
        missing: Vec<u16>,
    },
    /// Peer confirmed chunk-layer reassembly; drop the cached train and stop
    /// probing. The spool entry still waits for the end-to-end ack envelope.
    Confirmed { prefix: IdPrefix, message_id: String },
    /// Resend the highest-sequence cached chunk (window_fec redundancy hint).
    RepeatLast { to: String, prefix: IdPrefix },
}

pub struct Strategy {
    method: ReliabilityMethod,
}

impl Strategy {
    pub fn new(method: ReliabilityMethod) -> Self {
        Self { method }
    }

    pub fn method(&self) -> ReliabilityMethod {
        self.method
    }

    /// Actions before the first chunk of a train goes out.
    pub fn before_send(&self, message_id: &str, dest: &str, total: u16) -> Vec<ControlAction> {
        match self.method {
            ReliabilityMethod::Stage if total > 1 => vec![ControlAction::Control {
                to: dest.to_owned(),
                msg: ControlMsg::Announce {
                    message_id: message_id.to_owned(),
                    total,
                },
            }],
            _ => Vec::new(),
        }
    }

    /// Actions after the full chunk train has been handed to the radio.
    /// Single-chunk messages skip the bitmap probe and rely on the
    /// end-to-end ack alone.
    pub fn after_chunks_sent(&self, message_id: &str, dest: &str, total: u16) -> Vec<ControlAction> {
        if total <= 1 {
            return Vec::new();
        }
        match self.method {
            ReliabilityMethod::Simple => Vec::new(),
            ReliabilityMethod::Stage => vec![ControlAction::Control {
                to: dest.to_owned(),
                msg: ControlMsg::Complete {
                    message_id: message_id.to_owned(),
                },
            }],
            ReliabilityMethod::Window => vec![ControlAction::Control {
                to: dest.to_owned(),
                msg: ControlMsg::BitmapReq {
                    message_id: message_id.to_owned(),
                },
            }],
            ReliabilityMethod::WindowFec => vec![
                ControlAction::Control {
                    to: dest.to_owned(),
                    msg: ControlMsg::BitmapReq {
                        message_id: message_id.to_owned(),
                    },
                },
                ControlAction::RepeatLast {
                    to: dest.to_owned(),
                    prefix: meshbridge_protocol::frame::id_prefix(message_id),
                },
            ],
        }
    }

    /// Actions when the progress-resetting timer for a pending send expires.
    pub fn on_probe_timeout(&self, message_id: &str, dest: &str, total: u16) -> Vec<ControlAction> {
        if total <= 1 {
            return Vec::new();
        }
        match self.method {
            ReliabilityMethod::Simple => Vec::new(),
            ReliabilityMethod::Stage => vec![ControlAction::Control {
                to: dest.to_owned(),
                msg: ControlMsg::Complete {
                    message_id: message_id.to_owned(),
                },
            }],
            ReliabilityMethod::Window | ReliabilityMethod::WindowFec => {
                vec![ControlAction::Control {
                    to: dest.to_owned(),
                    msg: ControlMsg::BitmapReq {
                        message_id: message_id.to_owned(),
                    },
                }]
            }
        }
    }

    /// Handle an inbound control frame (ACK or NACK flag set).
    pub fn handle_control(
        &self,
        header: &ChunkHeader,
        body: &[u8],
        sender: &str,
        reassembler: &Reassembler,
    ) -> Vec<ControlAction> {
        if self.method == ReliabilityMethod::Simple {
            // Single-shot mode consumes control traffic without reacting.
            return Vec::new();
        }

        if header.flags & FLAG_NACK != 0 {
            let missing = parse_nack_bitmap(body, header.total);
            if missing.is_empty() {
                return Vec::new();
            }
            return vec![ControlAction::Resend {
                to: sender.to_owned(),
                prefix: header.prefix,
                missing,
            }];
        }

        if header.flags & FLAG_ACK == 0 {
            return Vec::new();
        }
        let Some(msg) = ControlMsg::parse(body) else {
            tracing::debug!(
                sender,
                prefix = %prefix_str(&header.prefix),
                "unparseable control body, ignored"
            );
            return Vec::new();
        };

        match msg {
            ControlMsg::AllReceived { message_id } => vec![ControlAction::Confirmed {
                prefix: header.prefix,
                message_id,
            }],
            ControlMsg::BitmapReq { message_id } | ControlMsg::Complete { message_id } => {
                self.report_missing(sender, &header.prefix, &message_id, reassembler)
            }
            ControlMsg::Announce { message_id, .. } => match self.method {
                ReliabilityMethod::Stage => vec![ControlAction::Control {
                    to: sender.to_owned(),
                    msg: ControlMsg::AnnounceAck { message_id },
                }],
                _ => Vec::new(),
            },
            ControlMsg::AnnounceAck { .. } => Vec::new(),
        }
    }

    /// Answer a bitmap request: NACK with all gaps (trailing included), or
    /// all_received when the bucket is gone or complete.
    fn report_missing(
        &self,
        sender: &str,
        prefix: &IdPrefix,
        message_id: &str,
        reassembler: &Reassembler,
    ) -> Vec<ControlAction> {
        match reassembler.missing_sequences(sender, prefix, true) {
            Some((total, missing)) if !missing.is_empty() => vec![ControlAction::Nack {
                to: sender.to_owned(),
                prefix: *prefix,
                total,
                missing,
            }],
            // No bucket means the message already completed (buckets are
            // destroyed on delivery) or never started; either way the sender
            // learns nothing useful from a bitmap.
            _ => vec![ControlAction::Control {
                to: sender.to_owned(),
                msg: ControlMsg::AllReceived {
                    message_id: message_id.to_owned(),
                },
            }],
        }
    }

    /// A data chunk exposed a gap: emit a NACK for the missing set.
    pub fn on_gap(
        &self,
        sender: &str,
        prefix: IdPrefix,
        total: u16,
        missing: Vec<u16>,
    ) -> Vec<ControlAction> {
        if missing.is_empty() || self.method == ReliabilityMethod::Simple {
            return Vec::new();
        }
        vec![ControlAction::Nack {
            to: sender.to_owned(),
            prefix,
            total,
            missing,
        }]
    }

    /// A message fully reassembled: confirm at the chunk layer.
    pub fn on_complete(&self, sender: &str, message_id: &str) -> Vec<ControlAction> {
        match self.method {
            ReliabilityMethod::Simple => Vec::new(),
            _ => vec![ControlAction::Control {
                to: sender.to_owned(),
                msg: ControlMsg::AllReceived {
                    message_id: message_id.to_owned(),
                },
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reassembly::ReassemblyConfig;
    use meshbridge_protocol::frame::{build_control_chunk, build_nack_chunk, id_prefix, parse_chunk};
    use std::time::Instant;

    fn control_header(prefix: IdPrefix) -> ChunkHeader {
        ChunkHeader {
            flags: FLAG_ACK,
            prefix,
            seq: 1,
            total: 1,
        }
    }

    fn partial_reassembler(sender: &str, id: &str, have: &[u16], total: u16) -> Reassembler {
        let mut reasm = Reassembler::new(ReassemblyConfig::default());
        let now = Instant::now();
        for &seq in have {
            let header = ChunkHeader {
                flags: 0,
                prefix: id_prefix(id),
                seq,
                total,
            };
            reasm.ingest(sender, &header, b"x", now);
        }
        reasm
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!("window".parse::<ReliabilityMethod>().unwrap(), ReliabilityMethod::Window);
        assert_eq!(
            "selective_repeat".parse::<ReliabilityMethod>().unwrap(),
            ReliabilityMethod::Window
        );
        assert_eq!("staged".parse::<ReliabilityMethod>().unwrap(), ReliabilityMethod::Stage);
        assert_eq!(
            "window_fec".parse::<ReliabilityMethod>().unwrap(),
            ReliabilityMethod::WindowFec
        );
        assert!("carrier_pigeon".parse::<ReliabilityMethod>().is_err());
        assert_eq!(ReliabilityMethod::default(), ReliabilityMethod::Window);
    }

    #[test]
    fn test_window_probes_after_multichunk_train() {
        let strategy = Strategy::new(ReliabilityMethod::Window);
        let actions = strategy.after_chunks_sent("aaaa-1111", "gw", 6);
        assert_eq!(
            actions,
            vec![ControlAction::Control {
                to: "gw".into(),
                msg: ControlMsg::BitmapReq {
                    message_id: "aaaa-1111".into()
                },
            }]
        );
    }

    #[test]
    fn test_single_chunk_skips_probe() {
        for method in [
            ReliabilityMethod::Window,
            ReliabilityMethod::WindowFec,
            ReliabilityMethod::Stage,
        ] {
            let strategy = Strategy::new(method);
            assert!(strategy.after_chunks_sent("id", "gw", 1).is_empty());
            assert!(strategy.on_probe_timeout("id", "gw", 1).is_empty());
        }
    }

    #[test]
    fn test_bitmap_req_answered_with_gaps() {
        let strategy = Strategy::new(ReliabilityMethod::Window);
        let reasm = partial_reassembler("client-1", "msg-0001", &[1, 2, 4], 6);

        let frame = build_control_chunk(&ControlMsg::BitmapReq {
            message_id: "msg-0001".into(),
        })
        .unwrap();
        let (header, body) = parse_chunk(&frame).unwrap();
        let actions = strategy.handle_control(&header, body, "client-1", &reasm);
        assert_eq!(
            actions,
            vec![ControlAction::Nack {
                to: "client-1".into(),
                prefix: id_prefix("msg-0001"),
                total: 6,
                missing: vec![3, 5, 6],
            }]
        );
    }

    #[test]
    fn test_bitmap_req_with_no_bucket_confirms() {
        let strategy = Strategy::new(ReliabilityMethod::Window);
        let reasm = Reassembler::new(ReassemblyConfig::default());
        let header = control_header(id_prefix("msg-0001"));
        let actions = strategy.handle_control(
            &header,
            b"bitmap_req|msg-0001",
            "client-1",
            &reasm,
        );
        assert_eq!(
            actions,
            vec![ControlAction::Control {
                to: "client-1".into(),
                msg: ControlMsg::AllReceived {
                    message_id: "msg-0001".into()
                },
            }]
        );
    }

    #[test]
    fn test_all_received_confirms_pending() {
        let strategy = Strategy::new(ReliabilityMethod::Window);
        let reasm = Reassembler::new(ReassemblyConfig::default());
        let header = control_header(id_prefix("aaaa-1111"));
        let actions =
            strategy.handle_control(&header, b"all_received|aaaa-1111", "gw", &reasm);
        assert_eq!(
            actions,
            vec![ControlAction::Confirmed {
                prefix: id_prefix("aaaa-1111"),
                message_id: "aaaa-1111".into(),
            }]
        );
    }

    #[test]
    fn test_nack_triggers_resend() {
        let strategy = Strategy::new(ReliabilityMethod::Window);
        let reasm = Reassembler::new(ReassemblyConfig::default());
        let frame = build_nack_chunk(id_prefix("msg-0001"), 6, &[3]).unwrap();
        let (header, body) = parse_chunk(&frame).unwrap();
        let actions = strategy.handle_control(&header, body, "gw", &reasm);
        assert_eq!(
            actions,
            vec![ControlAction::Resend {
                to: "gw".into(),
                prefix: id_prefix("msg-0001"),
                missing: vec![3],
            }]
        );
    }

    #[test]
    fn test_simple_mode_is_single_shot() {
        let strategy = Strategy::new(ReliabilityMethod::Simple);
        let reasm = Reassembler::new(ReassemblyConfig::default());

        assert!(strategy.after_chunks_sent("id", "gw", 6).is_empty());
        assert!(strategy
            .on_gap("gw", id_prefix("id"), 6, vec![2, 3])
            .is_empty());
        assert!(strategy.on_complete("gw", "id").is_empty());

        let frame = build_nack_chunk(id_prefix("id"), 6, &[3]).unwrap();
        let (header, body) = parse_chunk(&frame).unwrap();
        assert!(strategy.handle_control(&header, body, "gw", &reasm).is_empty());
    }

    #[test]
    fn test_stage_handshake() {
        let strategy = Strategy::new(ReliabilityMethod::Stage);
        let reasm = Reassembler::new(ReassemblyConfig::default());

        assert_eq!(
            strategy.before_send("msg-1", "gw", 4),
            vec![ControlAction::Control {
                to: "gw".into(),
                msg: ControlMsg::Announce {
                    message_id: "msg-1".into(),
                    total: 4
                },
            }]
        );
        assert_eq!(
            strategy.after_chunks_sent("msg-1", "gw", 4),
            vec![ControlAction::Control {
                to: "gw".into(),
                msg: ControlMsg::Complete {
                    message_id: "msg-1".into()
                },
            }]
        );

        // Receiver side acknowledges the announce.
        let header = control_header(id_prefix("msg-1"));
        let actions = strategy.handle_control(&header, b"announce|msg-1|4", "client", &reasm);
        assert_eq!(
            actions,
            vec![ControlAction::Control {
                to: "client".into(),
                msg: ControlMsg::AnnounceAck {
                    message_id: "msg-1".into()
                },
            }]
        );
    }

    #[test]
    fn test_window_fec_repeats_last_chunk() {
        let strategy = Strategy::new(ReliabilityMethod::WindowFec);
        let actions = strategy.after_chunks_sent("msg-1", "gw", 4);
        assert_eq!(actions.len(), 2);
        assert!(matches!(actions[1], ControlAction::RepeatLast { .. }));
    }

    #[test]
    fn test_gap_emits_nack() {
        let strategy = Strategy::new(ReliabilityMethod::Window);
        let actions = strategy.on_gap("gw", id_prefix("m"), 6, vec![2, 3]);
        assert_eq!(
            actions,
            vec![ControlAction::Nack {
                to: "gw".into(),
                prefix: id_prefix("m"),
                total: 6,
                missing: vec![2, 3],
            }]
        );
        assert!(strategy.on_gap("gw", id_prefix("m"), 6, vec![]).is_empty());
    }
}
