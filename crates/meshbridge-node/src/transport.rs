//! Outbound plumbing: the radio writer task, the sent-chunk cache for
//! targeted resends, and the pending-send table with progress-resetting
//! probe timers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshbridge_protocol::frame::{prefix_str, IdPrefix};
use tokio::sync::{broadcast, mpsc};

use crate::radio::Radio;

/// One frame queued for the radio.
#[derive(Debug)]
pub struct Outgoing {
    pub to: String,
    pub frame: Vec<u8>,
}

/// Spawn the single writer task. All outbound frames funnel through the
/// returned sender so radio access stays single-writer.
pub fn spawn_writer(
    radio: Arc<dyn Radio>,
    mut shutdown: broadcast::Receiver<()>,
) -> mpsc::Sender<Outgoing> {
    let (tx, mut rx) = mpsc::channel::<Outgoing>(256);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    // Drain anything already queued before releasing the radio.
                    while let Ok(Outgoing { to, frame }) = rx.try_recv() {
                        if let Err(err) = radio.send_frame(&to, &frame).await {
                            tracing::warn!(destination = %to, %err, "radio send failed during drain");
                        }
                    }
                    break;
                }
                item = rx.recv() => {
                    let Some(Outgoing { to, frame }) = item else { break };
                    if let Err(err) = radio.send_frame(&to, &frame).await {
                        tracing::warn!(destination = %to, %err, "radio send failed");
                    }
                }
            }
        }
        tracing::debug!("radio writer stopped");
    });
    tx
}

// ============================================================================
// Sent-chunk cache
// ============================================================================

struct CacheEntry {
    /// Chunk frames indexed by sequence - 1.
    chunks: Vec<Vec<u8>>,
    expires: Instant,
}

/// Caches transmitted chunk trains so NACKs can be answered with targeted
/// resends instead of a full retransmit.
pub struct ChunkCache {
    entries: HashMap<IdPrefix, CacheEntry>,
    ttl: Duration,
}

impl ChunkCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn insert(&mut self, prefix: IdPrefix, chunks: Vec<Vec<u8>>, now: Instant) {
        self.entries.insert(
            prefix,
            CacheEntry {
                chunks,
                expires: now + self.ttl,
            },
        );
    }

    /// Frames for the requested sequences, ascending. Refreshes the entry's
    /// TTL since the peer is clearly still working on this message.
    pub fn take_seqs(&mut self, prefix: &IdPrefix, seqs: &[u16], now: Instant) -> Vec<Vec<u8>> {
        let Some(entry) = self.entries.get_mut(prefix) else {
            return Vec::new();
        };
        entry.expires = now + self.ttl;
        let mut sorted: Vec<u16> = seqs.to_vec();
        sorted.sort_unstable();
        sorted
            .into_iter()
            .filter_map(|seq| entry.chunks.get(seq as usize - 1).cloned())
            .collect()
    }

    /// Highest-sequence frame, for the window_fec redundancy hint.
    pub fn last(&self, prefix: &IdPrefix) -> Option<Vec<u8>> {
        self.entries
            .get(prefix)
            .and_then(|entry| entry.chunks.last().cloned())
    }

    pub fn remove(&mut self, prefix: &IdPrefix) {
        self.entries.remove(prefix);
    }

    pub fn prune(&mut self, now: Instant) {
        self.entries.retain(|prefix, entry| {
            let keep = entry.expires > now;
            if !keep {
                tracing::debug!(prefix = %prefix_str(prefix), "chunk cache entry expired");
            }
            keep
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Pending sends
// ============================================================================

#[derive(Debug)]
pub struct PendingSend {
    pub message_id: String,
    pub destination: String,
    pub total: u16,
    started: Instant,
    last_progress: Instant,
    /// No probing before this instant (post-send quiet period).
    quiet_until: Instant,
    probes: u32,
}

/// A probe the sweeper should fire for a stalled pending send.
#[derive(Debug)]
pub struct ProbeDue {
    pub message_id: String,
    pub destination: String,
    pub total: u16,
}

/// Tracks outbound messages between "chunks handed to the radio" and
/// "peer confirmed reassembly". The progress timer resets on any inbound
/// frame for the message and is bounded by an absolute cap, after which the
/// outbox schedule takes over.
pub struct PendingTable {
    map: HashMap<IdPrefix, PendingSend>,
    /// Progress-resetting probe timeout.
    timeout: Duration,
    /// Absolute cap on probing for one transmission attempt.
    absolute: Duration,
    /// Initial quiet window after the train before the first probe.
    quiet: Duration,
    max_probes: u32,
}

impl PendingTable {
    pub fn new(timeout: Duration, absolute: Duration, quiet: Duration) -> Self {
        Self {
            map: HashMap::new(),
            timeout,
            absolute,
            quiet,
            max_probes: 3,
        }
    }

    pub fn register(
        &mut self,
        prefix: IdPrefix,
        message_id: String,
        destination: String,
        total: u16,
        now: Instant,
    ) {
        self.map.insert(
            prefix,
            PendingSend {
                message_id,
                destination,
                total,
                started: now,
                last_progress: now,
                quiet_until: now + self.quiet,
                probes: 0,
            },
        );
    }

    /// Inbound activity for this message: reset the progress timer.
    /// Returns the message id when a pending send matched.
    pub fn progress(&mut self, prefix: &IdPrefix, now: Instant) -> Option<&str> {
        let entry = self.map.get_mut(prefix)?;
        entry.last_progress = now;
        Some(entry.message_id.as_str())
    }

    /// Peer confirmed chunk-layer reassembly; stop probing.
    pub fn confirm(&mut self, prefix: &IdPrefix) -> Option<PendingSend> {
        self.map.remove(prefix)
    }

    /// Pending sends whose progress timer expired. Each hit counts as a
    /// probe; entries past the absolute cap or probe budget are dropped and
    /// left to the outbox retry schedule.
    pub fn probes_due(&mut self, now: Instant) -> Vec<ProbeDue> {
        let mut due = Vec::new();
        let timeout = self.timeout;
        let absolute = self.absolute;
        let max_probes = self.max_probes;

        self.map.retain(|prefix, entry| {
            if now.duration_since(entry.started) >= absolute || entry.probes >= max_probes {
                tracing::debug!(
                    prefix = %prefix_str(prefix),
                    message_id = %entry.message_id,
                    "pending send past its cap, deferring to outbox schedule"
                );
                return false;
            }
            if now >= entry.quiet_until && now.duration_since(entry.last_progress) >= timeout {
                entry.probes += 1;
                entry.last_progress = now;
                due.push(ProbeDue {
                    message_id: entry.message_id.clone(),
                    destination: entry.destination.clone(),
                    total: entry.total,
                });
            }
            true
        });
        due
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_protocol::frame::id_prefix;

    #[test]
    fn test_chunk_cache_targeted_resend() {
        let mut cache = ChunkCache::new(Duration::from_secs(60));
        let now = Instant::now();
        let prefix = id_prefix("msg-1");
        cache.insert(
            prefix,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()],
            now,
        );

        // Out-of-order request comes back ascending.
        let frames = cache.take_seqs(&prefix, &[3, 1], now);
        assert_eq!(frames, vec![b"one".to_vec(), b"three".to_vec()]);

        // Unknown sequences are skipped, unknown prefixes yield nothing.
        assert_eq!(cache.take_seqs(&prefix, &[9], now).len(), 0);
        assert!(cache.take_seqs(&id_prefix("other"), &[1], now).is_empty());
    }

    #[test]
    fn test_chunk_cache_prune_and_refresh() {
        let mut cache = ChunkCache::new(Duration::from_secs(60));
        let now = Instant::now();
        let prefix = id_prefix("msg-1");
        cache.insert(prefix, vec![b"x".to_vec()], now);

        // A resend at +50s refreshes the TTL past the original expiry.
        cache.take_seqs(&prefix, &[1], now + Duration::from_secs(50));
        cache.prune(now + Duration::from_secs(70));
        assert_eq!(cache.len(), 1);

        cache.prune(now + Duration::from_secs(200));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pending_probe_after_timeout() {
        let mut pending = PendingTable::new(
            Duration::from_secs(90),
            Duration::from_secs(150),
            Duration::from_secs(10),
        );
        let now = Instant::now();
        let prefix = id_prefix("msg-1");
        pending.register(prefix, "msg-1".into(), "gw".into(), 6, now);

        // Inside the quiet window nothing fires.
        assert!(pending.probes_due(now + Duration::from_secs(5)).is_empty());

        // After the progress timeout a probe fires once.
        let due = pending.probes_due(now + Duration::from_secs(95));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message_id, "msg-1");
        assert!(pending.probes_due(now + Duration::from_secs(96)).is_empty());
    }

    #[test]
    fn test_pending_progress_resets_timer() {
        let mut pending = PendingTable::new(
            Duration::from_secs(90),
            Duration::from_secs(500),
            Duration::ZERO,
        );
        let now = Instant::now();
        let prefix = id_prefix("msg-1");
        pending.register(prefix, "msg-1".into(), "gw".into(), 6, now);

        assert_eq!(
            pending.progress(&prefix, now + Duration::from_secs(80)),
            Some("msg-1")
        );
        // 90s after start but only 10s after progress: no probe.
        assert!(pending.probes_due(now + Duration::from_secs(90)).is_empty());
        // 90s after the progress event: probe.
        assert_eq!(pending.probes_due(now + Duration::from_secs(171)).len(), 1);
    }

    #[test]
    fn test_pending_absolute_cap_drops_entry() {
        let mut pending = PendingTable::new(
            Duration::from_secs(90),
            Duration::from_secs(150),
            Duration::ZERO,
        );
        let now = Instant::now();
        let prefix = id_prefix("msg-1");
        pending.register(prefix, "msg-1".into(), "gw".into(), 6, now);
        pending.progress(&prefix, now + Duration::from_secs(149));

        // Past the absolute cap the entry is gone even though progress was
        // recent; retries belong to the outbox now.
        assert!(pending.probes_due(now + Duration::from_secs(151)).is_empty());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_pending_confirm_removes() {
        let mut pending = PendingTable::new(
            Duration::from_secs(90),
            Duration::from_secs(150),
            Duration::ZERO,
        );
        let now = Instant::now();
        let prefix = id_prefix("msg-1");
        pending.register(prefix, "msg-1".into(), "gw".into(), 6, now);
        let entry = pending.confirm(&prefix).unwrap();
        assert_eq!(entry.message_id, "msg-1");
        assert!(pending.is_empty());
    }
}
