//! Gateway-side request dedupe with execution leases.
//!
//! At-least-once transport means the same request id can arrive many times;
//! this cache pins each id to one HTTP execution and replays the cached
//! response for every later copy. An in-progress lease rejects concurrent
//! duplicates while the first execution is still running.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use meshbridge_protocol::Envelope;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct DedupeConfig {
    /// How long a cached response keeps answering retries.
    pub ttl: Duration,
    /// In-progress lease duration; bounds how long concurrent duplicates
    /// are rejected if an execution wedges.
    pub lease: Duration,
    /// Soft entry cap; exceeding it evicts the oldest cached response.
    pub max_entries: usize,
    /// Also index by semantic fingerprint to catch retries that
    /// (incorrectly) mutate the request id.
    pub semantic: bool,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            lease: Duration::from_secs(300),
            max_entries: 256,
            semantic: false,
        }
    }
}

#[derive(Debug)]
struct SeenEntry {
    response: Envelope,
    fingerprint: Option<String>,
    created: Instant,
    expires: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    seen: HashMap<String, SeenEntry>,
    by_fingerprint: HashMap<String, String>,
    leases: HashMap<String, Instant>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupeDecision {
    /// First sighting: caller must execute, then `store` or `release`.
    Execute,
    /// Replay this cached response; do not re-execute.
    CachedHit(Envelope),
    /// Another copy is executing right now; drop this one, the peer retries.
    InFlight,
    /// Same id with a divergent payload. Reject.
    Conflict,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DedupeStats {
    pub entries: usize,
    pub leases: usize,
}

pub struct DedupeCache {
    cfg: DedupeConfig,
    inner: RwLock<Inner>,
}

impl DedupeCache {
    pub fn new(cfg: DedupeConfig) -> Self {
        Self {
            cfg,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Semantic fingerprint: command plus canonicalized data, hashed.
    pub fn fingerprint(command: &str, data: &Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(command.as_bytes());
        hasher.update([0]);
        hasher.update(canonical_json(data).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Decide what to do with an inbound request.
    pub fn check(&self, id: &str, fingerprint: Option<&str>, now: Instant) -> DedupeDecision {
        enum Found {
            Expired,
            Conflict,
            Hit(Envelope),
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let found = inner.seen.get(id).map(|entry| {
            if entry.expires <= now {
                Found::Expired
            } else if matches!(
                (&entry.fingerprint, fingerprint),
                (Some(stored), Some(incoming)) if stored != incoming
            ) {
                Found::Conflict
            } else {
                Found::Hit(entry.response.clone())
            }
        });
        match found {
            Some(Found::Expired) => self.evict(&mut inner, id),
            Some(Found::Conflict) => {
                tracing::warn!(
                    message_id = id,
                    "divergent payload for a known request id, rejecting"
                );
                return DedupeDecision::Conflict;
            }
            Some(Found::Hit(response)) => return DedupeDecision::CachedHit(response),
            None => {}
        }

        if self.cfg.semantic {
            if let Some(fp) = fingerprint {
                if let Some(other_id) = inner.by_fingerprint.get(fp).cloned() {
                    if let Some(entry) = inner.seen.get(&other_id) {
                        if entry.expires > now {
                            tracing::debug!(
                                message_id = id,
                                cached_id = %other_id,
                                "semantic fingerprint hit for a mutated request id"
                            );
                            return DedupeDecision::CachedHit(entry.response.clone());
                        }
                    }
                }
            }
        }

        match inner.leases.get(id) {
            Some(expires) if *expires > now => DedupeDecision::InFlight,
            _ => {
                inner.leases.insert(id.to_owned(), now + self.cfg.lease);
                DedupeDecision::Execute
            }
        }
    }

    /// Record a completed execution and release its lease.
    pub fn store(&self, id: &str, fingerprint: Option<String>, response: Envelope, now: Instant) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.leases.remove(id);
        if let Some(fp) = &fingerprint {
            inner.by_fingerprint.insert(fp.clone(), id.to_owned());
        }
        inner.seen.insert(
            id.to_owned(),
            SeenEntry {
                response,
                fingerprint,
                created: now,
                expires: now + self.cfg.ttl,
            },
        );

        while inner.seen.len() > self.cfg.max_entries {
            let oldest = inner
                .seen
                .iter()
                .min_by_key(|(_, entry)| entry.created)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            self.evict(&mut inner, &key);
        }
    }

    /// Release a lease without caching (the execution failed; a retry
    /// should run again).
    pub fn release(&self, id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.leases.remove(id);
    }

    /// Drop expired entries and leases. Returns how many entries went.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = inner
            .seen
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.evict(&mut inner, key);
        }
        inner.leases.retain(|_, expires| *expires > now);
        expired.len()
    }

    pub fn stats(&self) -> DedupeStats {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        DedupeStats {
            entries: inner.seen.len(),
            leases: inner.leases.len(),
        }
    }

    fn evict(&self, inner: &mut Inner, id: &str) {
        if let Some(entry) = inner.seen.remove(id) {
            if let Some(fp) = entry.fingerprint {
                if inner.by_fingerprint.get(&fp).map(String::as_str) == Some(id) {
                    inner.by_fingerprint.remove(&fp);
                }
            }
        }
    }
}

/// Deterministic JSON rendering: object keys sorted recursively.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(key).unwrap_or_default(),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
