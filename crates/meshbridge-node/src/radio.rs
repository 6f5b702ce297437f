//! Radio adapters: a shared in-memory bus for tests/simulation and a
//! serial-port adapter for real hardware (feature `serial`).
//!
//! Adapters never fragment. Frames above `MAX_CHUNK_SIZE` are rejected
//! before any I/O happens.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use meshbridge_protocol::MAX_CHUNK_SIZE;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum RadioError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("radio closed")]
    Closed,
    #[error("io error: {0}")]
    Io(String),
}

/// Byte-frame send/receive over the mesh. Object-safe via boxed futures.
pub trait Radio: Send + Sync {
    fn send_frame<'a>(
        &'a self,
        destination: &'a str,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), RadioError>> + Send + 'a>>;

    fn recv_frame<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(String, Vec<u8>), RadioError>> + Send + 'a>>;

    fn close(&self) {}
}

// ============================================================================
// In-memory simulation bus
// ============================================================================

type DropFn = dyn Fn(u64, &str, &[u8]) -> bool + Send + Sync;

/// Loss model applied on the send side of the bus.
pub enum LossPolicy {
    None,
    /// Drop every Nth frame (1-based counter).
    EveryNth(u64),
    /// Drop roughly this percentage, deterministically seeded by counter.
    Percent(u8),
    /// Arbitrary predicate over (counter, destination, frame bytes).
    Custom(Box<DropFn>),
}

impl LossPolicy {
    fn should_drop(&self, counter: u64, destination: &str, frame: &[u8]) -> bool {
        match self {
            LossPolicy::None => false,
            LossPolicy::EveryNth(n) => *n > 0 && counter % n == 0,
            LossPolicy::Percent(percent) => {
                // Multiplicative hash of the counter for reproducible "random" loss.
                let hash = counter.wrapping_mul(0x9E37_79B9_7F4A_7C15);
                ((hash >> 56) as u8) % 100 < *percent
            }
            LossPolicy::Custom(f) => f(counter, destination, frame),
        }
    }
}

/// Shared medium connecting every simulated radio in the process.
pub struct SimBus {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<(String, Vec<u8>)>>>,
    loss: LossPolicy,
    delay: Duration,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl SimBus {
    pub fn new() -> Arc<Self> {
        Self::with_loss(LossPolicy::None, Duration::ZERO)
    }

    pub fn with_loss(loss: LossPolicy, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            loss,
            delay,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Register a node on the bus and get its radio endpoint.
    pub fn attach(self: &Arc<Self>, node_id: &str) -> SimRadio {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.to_owned(), tx);
        SimRadio {
            node_id: node_id.to_owned(),
            bus: Arc::clone(self),
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Frames accepted for delivery (dropped ones included).
    pub fn frames_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn route(&self, source: &str, destination: &str, frame: &[u8]) {
        let counter = self.sent.fetch_add(1, Ordering::Relaxed) + 1;
        if self.loss.should_drop(counter, destination, frame) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(counter, destination, "sim bus dropped frame");
            return;
        }
        let target = self
            .queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .cloned();
        let Some(target) = target else {
            tracing::debug!(destination, "sim bus has no such node, frame lost");
            return;
        };
        let item = (source.to_owned(), frame.to_vec());
        if self.delay.is_zero() {
            let _ = target.send(item);
        } else {
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = target.send(item);
            });
        }
    }
}

/// One node's endpoint on the simulated bus.
pub struct SimRadio {
    node_id: String,
    bus: Arc<SimBus>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, Vec<u8>)>>,
}

impl Radio for SimRadio {
    fn send_frame<'a>(
        &'a self,
        destination: &'a str,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), RadioError>> + Send + 'a>> {
        Box::pin(async move {
            if frame.len() > MAX_CHUNK_SIZE {
                return Err(RadioError::FrameTooLarge {
                    size: frame.len(),
                    max: MAX_CHUNK_SIZE,
                });
            }
            self.bus.route(&self.node_id, destination, frame);
            Ok(())
        })
    }

    fn recv_frame<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<(String, Vec<u8>), RadioError>> + Send + 'a>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(RadioError::Closed)
        })
    }
}

// ============================================================================
// Serial adapter (feature "serial")
// ============================================================================

/// SLIP-framed serial transport for Meshtastic-class radios.
///
/// Frame body on the wire: `<node id utf-8> 0x00 <chunk bytes>`, SLIP
/// delimited. The attached radio firmware handles the actual mesh routing;
/// this adapter only frames bytes in and out of the port.
#[cfg(feature = "serial")]
pub mod serial {
    use super::{Radio, RadioError};
    use meshbridge_protocol::MAX_CHUNK_SIZE;
    use std::future::Future;
    use std::io::{Read, Write};
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const SLIP_END: u8 = 0xC0;
    const SLIP_ESC: u8 = 0xDB;
    const SLIP_ESC_END: u8 = 0xDC;
    const SLIP_ESC_ESC: u8 = 0xDD;

    pub fn slip_encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len() + 2);
        out.push(SLIP_END);
        for &byte in payload {
            match byte {
                SLIP_END => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_END]),
                SLIP_ESC => out.extend_from_slice(&[SLIP_ESC, SLIP_ESC_ESC]),
                other => out.push(other),
            }
        }
        out.push(SLIP_END);
        out
    }

    /// Incremental SLIP decoder; feed bytes, collect complete frames.
    #[derive(Default)]
    pub struct SlipDecoder {
        buf: Vec<u8>,
        escaped: bool,
    }

    impl SlipDecoder {
        pub fn feed(&mut self, bytes: &[u8], frames: &mut Vec<Vec<u8>>) {
            for &byte in bytes {
                if self.escaped {
                    self.escaped = false;
                    match byte {
                        SLIP_ESC_END => self.buf.push(SLIP_END),
                        SLIP_ESC_ESC => self.buf.push(SLIP_ESC),
                        other => self.buf.push(other),
                    }
                    continue;
                }
                match byte {
                    SLIP_END => {
                        if !self.buf.is_empty() {
                            frames.push(std::mem::take(&mut self.buf));
                        }
                    }
                    SLIP_ESC => self.escaped = true,
                    other => self.buf.push(other),
                }
            }
        }
    }

    pub struct SerialRadio {
        writer: Mutex<Box<dyn serialport::SerialPort>>,
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, Vec<u8>)>>,
    }

    impl SerialRadio {
        /// Open the port and spawn a blocking reader thread that SLIP-decodes
        /// inbound frames onto a channel.
        pub fn open(port: &str, baud: u32) -> Result<Self, RadioError> {
            let handle = serialport::new(port, baud)
                .timeout(Duration::from_millis(500))
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None)
                .open()
                .map_err(|e| RadioError::Io(e.to_string()))?;
            let reader = handle
                .try_clone()
                .map_err(|e| RadioError::Io(e.to_string()))?;

            let (tx, rx) = mpsc::unbounded_channel();
            std::thread::Builder::new()
                .name("serial-radio-reader".into())
                .spawn(move || Self::read_loop(reader, tx))
                .map_err(|e| RadioError::Io(e.to_string()))?;

            Ok(Self {
                writer: Mutex::new(handle),
                inbound: tokio::sync::Mutex::new(rx),
            })
        }

        fn read_loop(
            mut port: Box<dyn serialport::SerialPort>,
            tx: mpsc::UnboundedSender<(String, Vec<u8>)>,
        ) {
            let mut decoder = SlipDecoder::default();
            let mut chunk = [0u8; 512];
            let mut frames = Vec::new();
            loop {
                match port.read(&mut chunk) {
                    Ok(0) => continue,
                    Ok(n) => {
                        decoder.feed(&chunk[..n], &mut frames);
                        for frame in frames.drain(..) {
                            let Some(split) = frame.iter().position(|b| *b == 0) else {
                                tracing::debug!("serial frame without sender id, dropped");
                                continue;
                            };
                            let sender = String::from_utf8_lossy(&frame[..split]).into_owned();
                            let payload = frame[split + 1..].to_vec();
                            if tx.send((sender, payload)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(err) => {
                        tracing::error!(%err, "serial read failed, reader stopping");
                        return;
                    }
                }
            }
        }
    }

    impl Radio for SerialRadio {
        fn send_frame<'a>(
            &'a self,
            destination: &'a str,
            frame: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<(), RadioError>> + Send + 'a>> {
            Box::pin(async move {
                if frame.len() > MAX_CHUNK_SIZE {
                    return Err(RadioError::FrameTooLarge {
                        size: frame.len(),
                        max: MAX_CHUNK_SIZE,
                    });
                }
                let mut body = Vec::with_capacity(destination.len() + 1 + frame.len());
                body.extend_from_slice(destination.as_bytes());
                body.push(0);
                body.extend_from_slice(frame);
                let encoded = slip_encode(&body);
                let mut writer = self
                    .writer
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                writer
                    .write_all(&encoded)
                    .map_err(|e| RadioError::Io(e.to_string()))
            })
        }

        fn recv_frame<'a>(
            &'a self,
        ) -> Pin<Box<dyn Future<Output = Result<(String, Vec<u8>), RadioError>> + Send + 'a>>
        {
            Box::pin(async move {
                let mut rx = self.inbound.lock().await;
                rx.recv().await.ok_or(RadioError::Closed)
            })
        }
    }

}
