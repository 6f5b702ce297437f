//! Chunk reassembly with per-(sender, prefix) TTL buckets.
//!
//! Gap detection is reactive only: a NACK is suggested when a newer sequence
//! arrives before older ones, never on a timer. Callers pass `now` so expiry
//! behavior stays testable without waiting out real TTLs.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use meshbridge_protocol::frame::{prefix_str, ChunkHeader, IdPrefix};
use meshbridge_protocol::{decode_envelope, Envelope};

#[derive(Debug, Clone)]
pub struct ReassemblyConfig {
    /// Minimum lifetime of a partially received message.
    pub base_ttl: Duration,
    /// TTL quantum added per fresh chunk, so larger messages get more time.
    pub per_chunk_ttl: Duration,
    /// Upper bound for any bucket's effective TTL.
    pub max_ttl: Duration,
    /// Max NACKs naming the same missing sequence within one message.
    pub nack_max_per_seq: u32,
    /// Minimum gap between NACK frames for the same message.
    pub nack_interval: Duration,
    /// Soft bucket cap; exceeding it evicts the stalest bucket.
    pub max_buckets: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(120),
            per_chunk_ttl: Duration::from_secs(2),
            max_ttl: Duration::from_secs(600),
            nack_max_per_seq: 3,
            nack_interval: Duration::from_secs(1),
            max_buckets: 256,
        }
    }
}

type BucketKey = (String, IdPrefix);

#[derive(Debug)]
struct Bucket {
    total: u16,
    received: BTreeMap<u16, Vec<u8>>,
    first_seen: Instant,
    last_update: Instant,
    ttl: Duration,
    total_warned: bool,
}

impl Bucket {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.first_seen) > self.ttl
    }
}

#[derive(Debug)]
struct NackState {
    last_missing: Vec<u16>,
    last_sent: Instant,
}

/// Result of ingesting one data chunk.
#[derive(Debug, Default)]
pub struct ChunkIngest {
    /// Fully reassembled envelope, when this chunk completed the set.
    pub completed: Option<Envelope>,
    /// Throttled set of sequences worth NACKing, when a gap is visible.
    pub missing: Option<Vec<u16>>,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ReassemblyStats {
    pub buckets: usize,
    pub chunks_buffered: usize,
}

pub struct Reassembler {
    cfg: ReassemblyConfig,
    buckets: HashMap<BucketKey, Bucket>,
    nack_state: HashMap<BucketKey, NackState>,
    nack_counts: HashMap<BucketKey, HashMap<u16, u32>>,
}

impl Reassembler {
    pub fn new(cfg: ReassemblyConfig) -> Self {
        Self {
            cfg,
            buckets: HashMap::new(),
            nack_state: HashMap::new(),
            nack_counts: HashMap::new(),
        }
    }

    /// Ingest one data chunk from `sender`.
    pub fn ingest(
        &mut self,
        sender: &str,
        header: &ChunkHeader,
        body: &[u8],
        now: Instant,
    ) -> ChunkIngest {
        if header.total == 0 || header.seq == 0 || header.seq > header.total {
            tracing::warn!(
                sender,
                prefix = %prefix_str(&header.prefix),
                seq = header.seq,
                total = header.total,
                "chunk sequence out of range, dropped"
            );
            return ChunkIngest::default();
        }

        let key: BucketKey = (sender.to_owned(), header.prefix);
        let is_new = !self.buckets.contains_key(&key);
        let base_ttl = self.cfg.base_ttl;
        let bucket = self.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            total: header.total,
            received: BTreeMap::new(),
            first_seen: now,
            last_update: now,
            ttl: base_ttl,
            total_warned: false,
        });

        if bucket.total != header.total {
            if !bucket.total_warned {
                tracing::warn!(
                    sender,
                    prefix = %prefix_str(&header.prefix),
                    bucket_total = bucket.total,
                    chunk_total = header.total,
                    "inconsistent chunk total, keeping existing bucket"
                );
                bucket.total_warned = true;
            }
            return ChunkIngest::default();
        }

        if let Some(existing) = bucket.received.get(&header.seq) {
            if existing.len() != body.len() {
                tracing::warn!(
                    sender,
                    prefix = %prefix_str(&header.prefix),
                    seq = header.seq,
                    "duplicate chunk with mismatched size, keeping first copy"
                );
            } else {
                tracing::debug!(
                    sender,
                    prefix = %prefix_str(&header.prefix),
                    seq = header.seq,
                    "duplicate chunk ignored"
                );
            }
            return ChunkIngest::default();
        }

        bucket.received.insert(header.seq, body.to_vec());
        bucket.last_update = now;
        bucket.ttl = (bucket.ttl + self.cfg.per_chunk_ttl).min(self.cfg.max_ttl);

        tracing::debug!(
            sender,
            prefix = %prefix_str(&header.prefix),
            seq = header.seq,
            received = bucket.received.len(),
            total = bucket.total,
            "chunk buffered"
        );

        // Expiry is the sweeper's job (prune). A chunk that completes the
        // set always delivers, even when the bucket has outlived its TTL
        // between sweeps.
        if bucket.received.len() == bucket.total as usize {
            let payload: Vec<u8> = bucket
                .received
                .values()
                .flat_map(|segment| segment.iter().copied())
                .collect();
            let total = bucket.total;
            self.drop_bucket(&key);
            match decode_envelope(&payload) {
                Ok(envelope) => {
                    tracing::info!(
                        sender,
                        prefix = %prefix_str(&header.prefix),
                        chunks = total,
                        "message reassembled"
                    );
                    return ChunkIngest {
                        completed: Some(envelope),
                        missing: None,
                    };
                }
                Err(err) => {
                    tracing::warn!(sender, %err, "reassembled payload failed to decode");
                    return ChunkIngest::default();
                }
            }
        }

        let missing = self.observe_gap(&key, now);

        if is_new {
            self.enforce_capacity(&key);
        }

        ChunkIngest {
            completed: None,
            missing,
        }
    }

    /// Missing sequences below the highest received one, throttled.
    fn observe_gap(&mut self, key: &BucketKey, now: Instant) -> Option<Vec<u16>> {
        let bucket = self.buckets.get(key)?;
        let highest = *bucket.received.keys().next_back()?;
        let missing: Vec<u16> = (1..highest)
            .filter(|seq| !bucket.received.contains_key(seq))
            .collect();
        if missing.is_empty() || !self.should_nack(key, &missing, now) {
            return None;
        }

        let counts = self.nack_counts.entry(key.clone()).or_default();
        let mut filtered = Vec::with_capacity(missing.len());
        for seq in missing {
            let attempts = counts.entry(seq).or_insert(0);
            if *attempts < self.cfg.nack_max_per_seq {
                *attempts += 1;
                filtered.push(seq);
            }
        }
        if filtered.is_empty() {
            return None;
        }
        self.nack_state.insert(
            key.clone(),
            NackState {
                last_missing: filtered.clone(),
                last_sent: now,
            },
        );
        Some(filtered)
    }

    fn should_nack(&self, key: &BucketKey, missing: &[u16], now: Instant) -> bool {
        match self.nack_state.get(key) {
            None => true,
            Some(state) if state.last_missing != missing => true,
            Some(state) => now.duration_since(state.last_sent) >= self.cfg.nack_interval,
        }
    }

    /// Missing sequences for a bucket, answering bitmap requests.
    /// With `force`, trailing gaps (above the highest seen sequence) are
    /// included; otherwise only observed gaps count. Returns the bucket's
    /// expected total alongside.
    pub fn missing_sequences(
        &self,
        sender: &str,
        prefix: &IdPrefix,
        force: bool,
    ) -> Option<(u16, Vec<u16>)> {
        let bucket = self.buckets.get(&(sender.to_owned(), *prefix))?;
        let highest = bucket.received.keys().next_back().copied().unwrap_or(0);
        let missing = (1..=bucket.total)
            .filter(|seq| !bucket.received.contains_key(seq) && (force || *seq < highest))
            .collect();
        Some((bucket.total, missing))
    }

    /// Remove expired buckets. Expired buckets never emit partial envelopes.
    pub fn prune(&mut self, now: Instant) -> usize {
        let expired: Vec<BucketKey> = self
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            tracing::debug!(
                sender = %key.0,
                prefix = %prefix_str(&key.1),
                "pruning expired reassembly bucket"
            );
            self.drop_bucket(key);
        }
        expired.len()
    }

    fn enforce_capacity(&mut self, just_added: &BucketKey) {
        while self.buckets.len() > self.cfg.max_buckets {
            let stalest = self
                .buckets
                .iter()
                .filter(|(key, _)| *key != just_added)
                .min_by_key(|(_, bucket)| bucket.last_update)
                .map(|(key, _)| key.clone());
            let Some(key) = stalest else { break };
            tracing::warn!(
                sender = %key.0,
                prefix = %prefix_str(&key.1),
                "bucket capacity exceeded, evicting stalest"
            );
            self.drop_bucket(&key);
        }
    }

    fn drop_bucket(&mut self, key: &BucketKey) {
        self.buckets.remove(key);
        self.nack_state.remove(key);
        self.nack_counts.remove(key);
    }

    pub fn snapshot(&self) -> ReassemblyStats {
        ReassemblyStats {
            buckets: self.buckets.len(),
            chunks_buffered: self.buckets.values().map(|b| b.received.len()).sum(),
        }
    }
}
