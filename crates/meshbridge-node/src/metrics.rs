//! Transport counters with Prometheus text exposition.
//!
//! A fixed set of process-wide counters, shared across the dispatcher and
//! gateway tasks as one `Arc` the same way the teacher threads its stats
//! struct through its tasks. Instantaneous state (spool depth, bucket
//! fill, dedupe size) is not mirrored here; the status API renders those
//! as gauges straight from the live structures.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct TransportMetrics {
    chunks_sent: AtomicU64,
    chunks_received: AtomicU64,
    chunk_resends: AtomicU64,
    nacks_sent: AtomicU64,
    invalid_frames: AtomicU64,
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    acks_received: AtomicU64,
    spool_retries: AtomicU64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_chunks_sent(&self, n: u64) {
        self.chunks_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_chunks_received(&self) {
        self.chunks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_chunk_resends(&self, n: u64) {
        self.chunk_resends.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_nacks_sent(&self) {
        self.nacks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_invalid_frames(&self) {
        self.invalid_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_messages_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_acks_received(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_spool_retries(&self) {
        self.spool_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// (short name, help text, current value) for every counter.
    fn samples(&self) -> [(&'static str, &'static str, u64); 9] {
        [
            (
                "chunks_sent",
                "Data chunks handed to the radio",
                self.chunks_sent.load(Ordering::Relaxed),
            ),
            (
                "chunks_received",
                "Data chunks accepted from the radio",
                self.chunks_received.load(Ordering::Relaxed),
            ),
            (
                "chunk_resends",
                "Chunks retransmitted in response to NACKs",
                self.chunk_resends.load(Ordering::Relaxed),
            ),
            (
                "nacks_sent",
                "NACK bitmap frames emitted",
                self.nacks_sent.load(Ordering::Relaxed),
            ),
            (
                "invalid_frames",
                "Inbound frames dropped at the framer",
                self.invalid_frames.load(Ordering::Relaxed),
            ),
            (
                "messages_sent",
                "Envelope chunk trains transmitted (retries included)",
                self.messages_sent.load(Ordering::Relaxed),
            ),
            (
                "messages_delivered",
                "Envelopes reassembled and delivered",
                self.messages_delivered.load(Ordering::Relaxed),
            ),
            (
                "acks_received",
                "End-to-end ack envelopes consumed by the outbox",
                self.acks_received.load(Ordering::Relaxed),
            ),
            (
                "spool_retries",
                "Spool records reissued by the retry scheduler",
                self.spool_retries.load(Ordering::Relaxed),
            ),
        ]
    }

    /// JSON object of counter values for the /status endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (name, _, value) in self.samples() {
            map.insert(name.to_owned(), serde_json::Value::from(value));
        }
        serde_json::Value::Object(map)
    }

    /// Prometheus text exposition for the counters.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in self.samples() {
            let full = format!("meshbridge_{name}_total");
            out.push_str(&format!("# HELP {full} {help}\n"));
            out.push_str(&format!("# TYPE {full} counter\n"));
            out.push_str(&format!("{full} {value}\n"));
        }
        out
    }
}

/// Append one gauge sample in Prometheus text form.
pub fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {value}\n"));
}
