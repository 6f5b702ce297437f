//! Meshbridge Spool -- durable outbox for envelopes awaiting end-to-end ack.
//!
//! Single JSON file, rewritten atomically (temp + rename) on every mutation.
//! Records survive process restarts; on startup they are rescheduled for an
//! immediate flush. A corrupt file is quarantined, never fatal.
//!
//! The scheduler state (`next_attempt`) is in-memory only; the disk format
//! is exactly `[{envelope, destination, first_submitted, retry_count}]`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use meshbridge_protocol::{Envelope, EnvelopeKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SpoolError>;

#[derive(Debug, Clone)]
pub struct SpoolConfig {
    pub path: PathBuf,
    /// Retries after the initial transmission before a record is dropped.
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wipe any existing spool file on open.
    pub clear_on_open: bool,
}

impl SpoolConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retries: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            clear_on_open: false,
        }
    }
}

/// Disk form of one pending envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolRecord {
    pub envelope: Envelope,
    pub destination: String,
    /// Unix seconds of the original submit.
    pub first_submitted: u64,
    pub retry_count: u32,
}

/// A record ready for (re)transmission.
#[derive(Debug, Clone)]
pub struct DueRecord {
    pub message_id: String,
    pub envelope: Envelope,
    pub destination: String,
    pub retry_count: u32,
}

#[derive(Debug, Clone)]
pub enum SpoolEvent {
    /// Retries exhausted without an ack; the record has been dropped.
    DeliveryFailed {
        message_id: String,
        destination: String,
    },
}

#[derive(Debug)]
struct Entry {
    record: SpoolRecord,
    next_attempt: Instant,
}

struct Inner {
    entries: HashMap<String, Entry>,
}

pub struct Spool {
    cfg: SpoolConfig,
    inner: Mutex<Inner>,
    events: broadcast::Sender<SpoolEvent>,
}

/// Backoff before the next attempt, retry_count attempts already made:
/// `min(max_delay, base * 2^retry_count)` scaled by jitter in [0.5, 1.5].
pub fn retry_delay(cfg: &SpoolConfig, retry_count: u32, jitter: f64) -> Duration {
    let exp = (cfg.base_delay.as_secs_f64() * 2f64.powi(retry_count.min(30) as i32))
        .min(cfg.max_delay.as_secs_f64());
    Duration::from_secs_f64(exp * jitter.clamp(0.5, 1.5))
}

impl Spool {
    /// Open the spool, loading (or quarantining) any existing file.
    pub fn open(cfg: SpoolConfig) -> Result<Self> {
        if let Some(parent) = cfg.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if cfg.clear_on_open && cfg.path.exists() {
            std::fs::remove_file(&cfg.path)?;
            tracing::info!(path = %cfg.path.display(), "spool cleared on open");
        }

        let entries = match Self::load(&cfg.path) {
            Ok(records) => {
                let now = Instant::now();
                records
                    .into_iter()
                    .map(|record| {
                        (
                            record.envelope.id.clone(),
                            Entry {
                                record,
                                // Replayed records flush immediately.
                                next_attempt: now,
                            },
                        )
                    })
                    .collect()
            }
            Err(err) => {
                quarantine(&cfg.path, &err);
                HashMap::new()
            }
        };

        let (events, _) = broadcast::channel(64);
        let spool = Self {
            cfg,
            inner: Mutex::new(Inner { entries }),
            events,
        };
        Ok(spool)
    }

    fn load(path: &Path) -> Result<Vec<SpoolRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read(path)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&raw)?)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist an envelope before its first transmission. Idempotent on id:
    /// a resubmit with the same id keeps the original record and schedule.
    /// `ack` envelopes are never spooled.
    pub fn submit(&self, envelope: &Envelope, destination: &str) -> Result<()> {
        if envelope.kind == EnvelopeKind::Ack {
            tracing::debug!(message_id = %envelope.id, "acks are not spooled");
            return Ok(());
        }
        let mut inner = self.lock();
        if inner.entries.contains_key(&envelope.id) {
            return Ok(());
        }
        let first_submitted = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        inner.entries.insert(
            envelope.id.clone(),
            Entry {
                record: SpoolRecord {
                    envelope: envelope.clone(),
                    destination: destination.to_owned(),
                    first_submitted,
                    retry_count: 0,
                },
                next_attempt: Instant::now(),
            },
        );
        self.rewrite(&inner)?;
        tracing::debug!(
            message_id = %envelope.id,
            destination,
            depth = inner.entries.len(),
            "envelope spooled"
        );
        Ok(())
    }

    /// End-to-end ack observed: drop the record. Returns whether it existed.
    pub fn on_ack(&self, message_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        if inner.entries.remove(message_id).is_none() {
            return Ok(false);
        }
        self.rewrite(&inner)?;
        tracing::info!(message_id, "spool record acked");
        Ok(true)
    }

    /// Records due for (re)transmission, highest priority first, then by
    /// schedule. Records whose final attempt's backoff window has elapsed
    /// without an ack are dropped here and surfaced as `DeliveryFailed`.
    pub fn due(&self, now: Instant) -> Result<Vec<DueRecord>> {
        let mut inner = self.lock();

        let exhausted: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.record.retry_count > self.cfg.retries && entry.next_attempt <= now
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &exhausted {
            if let Some(entry) = inner.entries.remove(id) {
                tracing::warn!(
                    message_id = %id,
                    destination = %entry.record.destination,
                    attempts = entry.record.retry_count,
                    "retries exhausted, dropping spool record"
                );
                let _ = self.events.send(SpoolEvent::DeliveryFailed {
                    message_id: id.clone(),
                    destination: entry.record.destination,
                });
            }
        }
        if !exhausted.is_empty() {
            self.rewrite(&inner)?;
        }

        let mut ready: Vec<&Entry> = inner
            .entries
            .values()
            .filter(|entry| entry.next_attempt <= now)
            .collect();
        // Priority first (lower wins), then submit age. No strict FIFO
        // across priorities.
        ready.sort_by_key(|entry| (entry.record.envelope.priority, entry.record.first_submitted));
        Ok(ready
            .into_iter()
            .map(|entry| DueRecord {
                message_id: entry.record.envelope.id.clone(),
                envelope: entry.record.envelope.clone(),
                destination: entry.record.destination.clone(),
                retry_count: entry.record.retry_count,
            })
            .collect())
    }

    /// Record a transmission attempt and schedule the next one.
    pub fn mark_attempt(&self, message_id: &str, now: Instant) -> Result<()> {
        let mut inner = self.lock();
        let Some(entry) = inner.entries.get_mut(message_id) else {
            return Ok(());
        };
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        let delay = retry_delay(&self.cfg, entry.record.retry_count, jitter);
        entry.record.retry_count += 1;
        entry.next_attempt = now + delay;
        tracing::debug!(
            message_id,
            attempt = entry.record.retry_count,
            next_in_secs = delay.as_secs_f64(),
            "spool attempt recorded"
        );
        self.rewrite(&inner)?;
        Ok(())
    }

    /// Push back the next retry while a message is actively progressing
    /// (chunks or control frames still flowing). In-memory only.
    pub fn delay_retry(&self, message_id: &str, min_delay: Duration, now: Instant) {
        let mut inner = self.lock();
        if let Some(entry) = inner.entries.get_mut(message_id) {
            entry.next_attempt = entry.next_attempt.max(now + min_delay);
        }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.lock().entries.contains_key(message_id)
    }

    pub fn depth(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpoolEvent> {
        self.events.subscribe()
    }

    /// Rewrite the whole file atomically: temp in the same directory, fsync,
    /// rename over the original.
    fn rewrite(&self, inner: &Inner) -> Result<()> {
        let records: Vec<&SpoolRecord> = {
            let mut list: Vec<&Entry> = inner.entries.values().collect();
            list.sort_by(|a, b| a.record.envelope.id.cmp(&b.record.envelope.id));
            list.into_iter().map(|entry| &entry.record).collect()
        };
        let payload = serde_json::to_vec(&records)?;

        let tmp = self.cfg.path.with_extension("tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.cfg.path)?;
        Ok(())
    }
}

/// Move a broken spool file aside so a human can inspect it later.
fn quarantine(path: &Path, err: &SpoolError) {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let target = path.with_extension(format!("corrupt-{stamp}"));
    match std::fs::rename(path, &target) {
        Ok(()) => tracing::warn!(
            path = %path.display(),
            quarantined = %target.display(),
            %err,
            "spool file corrupt, quarantined and starting empty"
        ),
        Err(rename_err) => tracing::error!(
            path = %path.display(),
            %err,
            %rename_err,
            "spool file corrupt and quarantine failed, starting empty"
        ),
    }
}
