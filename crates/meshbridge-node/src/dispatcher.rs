//! The dispatcher: owns all per-message state and routes traffic.
//!
//! Inbound: radio frames -> framer -> control handling or reassembly ->
//! delivered envelopes -> outbox ack / gateway queue / client rendezvous.
//! Outbound: envelopes -> spool -> chunk train -> writer task.
//!
//! Every envelope delivered to a peer is answered with an end-to-end `ack`
//! envelope; only that ack clears the sender's spool record. Acks
//! themselves are never acked and never reach application handlers.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use meshbridge_protocol::frame::{
    build_control_chunk, build_nack_chunk, chunk_payload, parse_chunk, prefix_str, IdPrefix,
};
use meshbridge_protocol::{
    encode_envelope, Envelope, EnvelopeKind, ProtocolError, MAX_ENVELOPE_BYTES,
};
use meshbridge_reliability::reassembly::ReassemblyStats;
use meshbridge_reliability::{ControlAction, DedupeCache, Reassembler, Strategy};
use meshbridge_spool::Spool;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::metrics::TransportMetrics;
use crate::radio::{Radio, RadioError};
use crate::transport::{spawn_writer, ChunkCache, Outgoing, PendingTable};
use crate::NodeError;

/// A request envelope delivered to the gateway role.
#[derive(Debug)]
pub struct InboundRequest {
    pub sender: String,
    pub envelope: Envelope,
}

/// Inbound activity notification, keyed by message-id prefix. Client waits
/// use these to reset their progress timers.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub prefix: IdPrefix,
    pub is_control: bool,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub node_id: String,
    pub segment_size: usize,
    /// Pace chunk trains at or above this many chunks. `None` disables.
    pub chunk_delay_threshold: Option<u16>,
    pub chunk_delay: Duration,
    /// Progress-resetting probe timeout for pending sends.
    pub timeout: Duration,
    /// Absolute probing cap per transmission attempt.
    pub absolute_timeout: Duration,
    /// Quiet window after a train before the first probe.
    pub quiet_period: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            node_id: "node-0".into(),
            segment_size: meshbridge_protocol::SEGMENT_SIZE,
            chunk_delay_threshold: None,
            chunk_delay: Duration::ZERO,
            timeout: Duration::from_secs(90),
            absolute_timeout: Duration::from_secs(150),
            quiet_period: Duration::from_secs(10),
        }
    }
}

pub struct Dispatcher {
    cfg: DispatcherConfig,
    strategy: Strategy,
    spool: Arc<Spool>,
    dedupe: Option<Arc<DedupeCache>>,
    writer: mpsc::Sender<Outgoing>,
    radio: Arc<dyn Radio>,
    reassembler: Mutex<Reassembler>,
    chunk_cache: Mutex<ChunkCache>,
    pending: Mutex<PendingTable>,
    waiters: Mutex<std::collections::HashMap<String, oneshot::Sender<Envelope>>>,
    progress: broadcast::Sender<ProgressEvent>,
    requests_tx: mpsc::Sender<InboundRequest>,
    shutdown: broadcast::Sender<()>,
    metrics: Arc<TransportMetrics>,
}

impl Dispatcher {
    /// Build the dispatcher and its request queue. The returned receiver is
    /// consumed by the gateway role; client-only nodes drop it.
    pub fn new(
        cfg: DispatcherConfig,
        radio: Arc<dyn Radio>,
        strategy: Strategy,
        reassembler: Reassembler,
        spool: Arc<Spool>,
        dedupe: Option<Arc<DedupeCache>>,
    ) -> (Arc<Self>, mpsc::Receiver<InboundRequest>) {
        let (shutdown, _) = broadcast::channel(4);
        let (progress, _) = broadcast::channel(64);
        let (requests_tx, requests_rx) = mpsc::channel(32);
        let writer = spawn_writer(Arc::clone(&radio), shutdown.subscribe());

        // Cache entries must outlive the longest plausible repair exchange.
        let cache_ttl = cfg.absolute_timeout.max(Duration::from_secs(300));
        let pending = PendingTable::new(cfg.timeout, cfg.absolute_timeout, cfg.quiet_period);

        let dispatcher = Arc::new(Self {
            strategy,
            spool,
            dedupe,
            writer,
            radio,
            reassembler: Mutex::new(reassembler),
            chunk_cache: Mutex::new(ChunkCache::new(cache_ttl)),
            pending: Mutex::new(pending),
            waiters: Mutex::new(std::collections::HashMap::new()),
            progress,
            requests_tx,
            shutdown,
            metrics: Arc::new(TransportMetrics::new()),
            cfg,
        });
        (dispatcher, requests_rx)
    }

    pub fn node_id(&self) -> &str {
        &self.cfg.node_id
    }

    pub fn spool(&self) -> &Arc<Spool> {
        &self.spool
    }

    pub fn reassembly_stats(&self) -> ReassemblyStats {
        self.lock_reassembler().snapshot()
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.metrics
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Stop the run loop and writer, then release the radio.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.radio.close();
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Submit an envelope for reliable delivery. Persists to the spool
    /// first (acks excepted), then transmits the chunk train.
    pub async fn submit(&self, envelope: &Envelope, destination: &str) -> Result<(), NodeError> {
        let encoded = encode_envelope(envelope)?;
        if encoded.len() > MAX_ENVELOPE_BYTES {
            return Err(NodeError::Protocol(ProtocolError::PayloadTooLarge {
                size: encoded.len(),
                max: MAX_ENVELOPE_BYTES,
            }));
        }
        self.spool.submit(envelope, destination)?;
        self.transmit(&envelope.id, &encoded, destination).await?;
        if envelope.kind != EnvelopeKind::Ack {
            self.spool.mark_attempt(&envelope.id, Instant::now())?;
        }
        Ok(())
    }

    /// Send one chunk train: cache it, register the pending send, pace if
    /// configured, and run the strategy's train hooks.
    async fn transmit(
        &self,
        message_id: &str,
        encoded: &[u8],
        destination: &str,
    ) -> Result<(), NodeError> {
        let chunks = chunk_payload(encoded, message_id, self.cfg.segment_size)?;
        let total = chunks.len() as u16;
        let prefix = meshbridge_protocol::frame::id_prefix(message_id);
        let now = Instant::now();

        self.lock_chunk_cache().insert(prefix, chunks.clone(), now);
        self.lock_pending().register(
            prefix,
            message_id.to_owned(),
            destination.to_owned(),
            total,
            now,
        );

        let actions = self.strategy.before_send(message_id, destination, total);
        self.execute_actions(actions).await;

        let pace = matches!(self.cfg.chunk_delay_threshold, Some(threshold) if total >= threshold)
            && !self.cfg.chunk_delay.is_zero();
        for chunk in chunks {
            self.enqueue_frame(destination, chunk).await;
            if pace {
                tokio::time::sleep(self.cfg.chunk_delay).await;
            }
        }
        self.metrics.inc_messages_sent();
        self.metrics.add_chunks_sent(total as u64);
        tracing::info!(
            message_id,
            destination,
            chunks = total,
            "chunk train transmitted"
        );

        let actions = self
            .strategy
            .after_chunks_sent(message_id, destination, total);
        self.execute_actions(actions).await;
        Ok(())
    }

    /// Reissue every due spool record through the reliability engine.
    pub async fn flush_outbox(&self) -> Result<usize, NodeError> {
        let due = self.spool.due(Instant::now())?;
        let count = due.len();
        for record in due {
            self.metrics.inc_spool_retries();
            tracing::info!(
                message_id = %record.message_id,
                attempt = record.retry_count + 1,
                "retransmitting spooled envelope"
            );
            let encoded = encode_envelope(&record.envelope)?;
            self.transmit(&record.message_id, &encoded, &record.destination)
                .await?;
            self.spool.mark_attempt(&record.message_id, Instant::now())?;
        }
        Ok(count)
    }

    /// Register a rendezvous for a response/error with this correlation id.
    pub fn register_waiter(&self, correlation_id: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.lock_waiters().insert(correlation_id.to_owned(), tx);
        rx
    }

    pub fn cancel_waiter(&self, correlation_id: &str) {
        self.lock_waiters().remove(correlation_id);
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Main loop: single radio reader plus the coarse sweeper tick.
    pub async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut sweeper = tokio::time::interval(Duration::from_secs(1));
        sweeper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = self.radio.recv_frame() => match received {
                    Ok((sender, frame)) => self.handle_frame(&sender, &frame).await,
                    Err(RadioError::Closed) => {
                        tracing::info!("radio closed, dispatcher stopping");
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(%err, "radio receive failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = sweeper.tick() => self.sweep(Instant::now()).await,
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    /// Route one raw frame from the radio.
    pub async fn handle_frame(&self, sender: &str, frame: &[u8]) {
        let (header, body) = match parse_chunk(frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.metrics.inc_invalid_frames();
                tracing::warn!(sender, %err, "dropping unparseable frame");
                return;
            }
        };
        let now = Instant::now();

        // Any frame for a pending send counts as progress: reset its probe
        // timer and hold the outbox retry off while the exchange is live.
        let progressed = self
            .lock_pending()
            .progress(&header.prefix, now)
            .map(str::to_owned);
        if let Some(message_id) = progressed {
            self.spool
                .delay_retry(&message_id, self.cfg.quiet_period, now);
        }
        let _ = self.progress.send(ProgressEvent {
            prefix: header.prefix,
            is_control: header.is_control(),
        });

        if header.is_control() {
            let actions = {
                let reassembler = self.lock_reassembler();
                self.strategy
                    .handle_control(&header, body, sender, &reassembler)
            };
            self.execute_actions(actions).await;
            return;
        }

        self.metrics.inc_chunks_received();
        let ingest = self
            .lock_reassembler()
            .ingest(sender, &header, body, now);

        if let Some(missing) = ingest.missing {
            let actions = self
                .strategy
                .on_gap(sender, header.prefix, header.total, missing);
            self.execute_actions(actions).await;
        }

        if let Some(envelope) = ingest.completed {
            self.deliver(sender, envelope).await;
        }
    }

    /// A fully reassembled envelope arrived.
    async fn deliver(&self, sender: &str, envelope: Envelope) {
        // Chunk-layer confirmation to the peer.
        let actions = self.strategy.on_complete(sender, &envelope.id);
        self.execute_actions(actions).await;

        match envelope.kind {
            EnvelopeKind::Ack => {
                // Consumed by the outbox; never forwarded to the application.
                self.metrics.inc_acks_received();
                let Some(correlation_id) = envelope.correlation_id.as_deref() else {
                    tracing::warn!(sender, message_id = %envelope.id, "ack without correlation id");
                    return;
                };
                match self.spool.on_ack(correlation_id) {
                    Ok(true) => {
                        tracing::info!(sender, correlation_id, "end-to-end ack, spool cleared")
                    }
                    Ok(false) => tracing::debug!(sender, correlation_id, "ack for unknown record"),
                    Err(err) => tracing::error!(sender, correlation_id, %err, "spool ack failed"),
                }
                return;
            }
            _ => {
                // Every non-ack delivery is acked end-to-end. The ack is not
                // spooled and not acked back.
                self.metrics.inc_messages_delivered();
                let ack = Envelope::ack(new_message_id(), envelope.id.as_str());
                if let Err(err) = self.submit(&ack, sender).await {
                    tracing::warn!(sender, message_id = %envelope.id, %err, "failed to send ack");
                }
            }
        }

        match envelope.kind {
            EnvelopeKind::Request => {
                tracing::info!(
                    sender,
                    message_id = %envelope.id,
                    command = envelope.command.as_deref().unwrap_or("unknown"),
                    "request delivered"
                );
                if let Err(err) = self
                    .requests_tx
                    .send(InboundRequest {
                        sender: sender.to_owned(),
                        envelope,
                    })
                    .await
                {
                    tracing::warn!(%err, "no request consumer, dropping inbound request");
                }
            }
            EnvelopeKind::Response | EnvelopeKind::Error => {
                let Some(correlation_id) = envelope.correlation_id.clone() else {
                    tracing::warn!(sender, message_id = %envelope.id, "response without correlation id");
                    return;
                };
                let waiter = self.lock_waiters().remove(&correlation_id);
                match waiter {
                    Some(tx) => {
                        if tx.send(envelope).is_err() {
                            tracing::debug!(correlation_id, "waiter gone before response arrived");
                        }
                    }
                    None => {
                        tracing::debug!(
                            sender,
                            correlation_id,
                            "late or duplicate response, no waiter"
                        );
                    }
                }
            }
            EnvelopeKind::Ack => unreachable!("acks handled above"),
        }
    }

    /// Coarse sweeper: prune reassembly and cache state, fire probe timers,
    /// flush the outbox, sweep the dedupe cache.
    pub async fn sweep(&self, now: Instant) {
        self.lock_reassembler().prune(now);
        self.lock_chunk_cache().prune(now);

        let probes = self.lock_pending().probes_due(now);
        for probe in probes {
            tracing::debug!(
                message_id = %probe.message_id,
                "progress timer expired, probing receiver"
            );
            let actions = self.strategy.on_probe_timeout(
                &probe.message_id,
                &probe.destination,
                probe.total,
            );
            self.execute_actions(actions).await;
        }

        if let Some(dedupe) = &self.dedupe {
            dedupe.sweep(now);
        }

        if let Err(err) = self.flush_outbox().await {
            tracing::error!(%err, "outbox flush failed");
        }
    }

    // ========================================================================
    // Action execution
    // ========================================================================

    async fn execute_actions(&self, actions: Vec<ControlAction>) {
        for action in actions {
            match action {
                ControlAction::Control { to, msg } => match build_control_chunk(&msg) {
                    Ok(frame) => self.enqueue_frame(&to, frame).await,
                    Err(err) => tracing::warn!(%err, "control chunk build failed"),
                },
                ControlAction::Nack {
                    to,
                    prefix,
                    total,
                    missing,
                } => {
                    tracing::info!(
                        destination = %to,
                        prefix = %prefix_str(&prefix),
                        ?missing,
                        "sending nack bitmap"
                    );
                    match build_nack_chunk(prefix, total, &missing) {
                        Ok(frame) => {
                            self.metrics.inc_nacks_sent();
                            self.enqueue_frame(&to, frame).await;
                        }
                        Err(err) => tracing::warn!(%err, "nack chunk build failed"),
                    }
                }
                ControlAction::Resend {
                    to,
                    prefix,
                    missing,
                } => {
                    let frames =
                        self.lock_chunk_cache()
                            .take_seqs(&prefix, &missing, Instant::now());
                    if frames.is_empty() {
                        tracing::debug!(
                            prefix = %prefix_str(&prefix),
                            "no cached chunks for nack, ignoring"
                        );
                        continue;
                    }
                    tracing::info!(
                        destination = %to,
                        prefix = %prefix_str(&prefix),
                        count = frames.len(),
                        "resending nacked chunks"
                    );
                    self.metrics.add_chunk_resends(frames.len() as u64);
                    for frame in frames {
                        self.enqueue_frame(&to, frame).await;
                    }
                }
                ControlAction::Confirmed { prefix, message_id } => {
                    tracing::debug!(
                        message_id,
                        "chunk layer confirmed, dropping cached train"
                    );
                    self.lock_chunk_cache().remove(&prefix);
                    self.lock_pending().confirm(&prefix);
                }
                ControlAction::RepeatLast { to, prefix } => {
                    let frame = self.lock_chunk_cache().last(&prefix);
                    if let Some(frame) = frame {
                        self.enqueue_frame(&to, frame).await;
                    }
                }
            }
        }
    }

    async fn enqueue_frame(&self, destination: &str, frame: Vec<u8>) {
        if self
            .writer
            .send(Outgoing {
                to: destination.to_owned(),
                frame,
            })
            .await
            .is_err()
        {
            tracing::warn!(destination, "writer task gone, frame dropped");
        }
    }

    // ========================================================================
    // Lock helpers (std mutexes, never held across an await)
    // ========================================================================

    fn lock_reassembler(&self) -> std::sync::MutexGuard<'_, Reassembler> {
        self.reassembler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_chunk_cache(&self) -> std::sync::MutexGuard<'_, ChunkCache> {
        self.chunk_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_waiters(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashMap<String, oneshot::Sender<Envelope>>>
    {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fresh message id: UUIDv4 hex truncated to 20 characters, enough
/// uniqueness at a fraction of the airtime of a full UUID string.
pub fn new_message_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(20);
    id
}
