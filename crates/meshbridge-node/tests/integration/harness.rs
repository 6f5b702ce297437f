//! Test harness: spin up gateway and client nodes on a shared SimBus
//! inside one tokio runtime.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshbridge_node::client::ClientConfig;
use meshbridge_node::dispatcher::DispatcherConfig;
use meshbridge_node::gateway::{CommandExecutor, ExecutorError};
use meshbridge_node::{Client, Dispatcher, Gateway, InboundRequest, SimBus};
use meshbridge_reliability::{
    DedupeCache, DedupeConfig, Reassembler, ReassemblyConfig, ReliabilityMethod, Strategy,
};
use meshbridge_spool::{Spool, SpoolConfig};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Records every executed command and echoes the payload back.
#[derive(Default)]
pub struct MockExecutor {
    calls: Mutex<Vec<(String, Value)>>,
}

impl MockExecutor {
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandExecutor for MockExecutor {
    fn execute<'a>(
        &'a self,
        command: &'a str,
        data: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ExecutorError>> + Send + 'a>> {
        Box::pin(async move {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_owned(), data.clone()));
            Ok(json!({ "echo": data }))
        })
    }
}

pub struct TestNode {
    pub node_id: String,
    pub dispatcher: Arc<Dispatcher>,
    pub dedupe: Option<Arc<DedupeCache>>,
    /// Client nodes keep their request queue to assert nothing
    /// application-visible ever lands on it.
    pub requests: Option<mpsc::Receiver<InboundRequest>>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl TestNode {
    pub async fn shutdown(mut self) {
        self.dispatcher.shutdown();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub fn spool_depth(&self) -> usize {
        self.dispatcher.spool().depth()
    }
}

pub struct NodeOptions {
    pub retries: u32,
    pub timeout: Duration,
    pub absolute_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            retries: 2,
            timeout: Duration::from_secs(20),
            absolute_timeout: Duration::from_secs(40),
        }
    }
}

fn build_node(
    bus: &Arc<SimBus>,
    node_id: &str,
    spool_path: &std::path::Path,
    opts: &NodeOptions,
    dedupe: Option<Arc<DedupeCache>>,
) -> (Arc<Dispatcher>, mpsc::Receiver<InboundRequest>) {
    let radio = Arc::new(bus.attach(node_id));
    let mut spool_cfg = SpoolConfig::new(spool_path);
    spool_cfg.retries = opts.retries;
    let spool = Arc::new(Spool::open(spool_cfg).unwrap());

    let cfg = DispatcherConfig {
        node_id: node_id.to_owned(),
        timeout: opts.timeout,
        absolute_timeout: opts.absolute_timeout,
        quiet_period: Duration::from_secs(1),
        ..DispatcherConfig::default()
    };
    Dispatcher::new(
        cfg,
        radio,
        Strategy::new(ReliabilityMethod::Window),
        Reassembler::new(ReassemblyConfig::default()),
        spool,
        dedupe,
    )
}

/// Gateway node with a running dispatcher and gateway loop.
pub fn spawn_gateway(
    bus: &Arc<SimBus>,
    node_id: &str,
    spool_path: &std::path::Path,
    executor: Arc<MockExecutor>,
) -> TestNode {
    let dedupe = Arc::new(DedupeCache::new(DedupeConfig::default()));
    let (dispatcher, requests) = build_node(
        bus,
        node_id,
        spool_path,
        &NodeOptions::default(),
        Some(Arc::clone(&dedupe)),
    );

    let run_handle = tokio::spawn(Arc::clone(&dispatcher).run());
    let gateway = Gateway::new(Arc::clone(&dispatcher), Arc::clone(&dedupe), executor);
    let shutdown = dispatcher.shutdown_handle().subscribe();
    let gateway_handle = tokio::spawn(async move {
        gateway.run(requests, shutdown).await;
    });

    TestNode {
        node_id: node_id.to_owned(),
        dispatcher,
        dedupe: Some(dedupe),
        requests: None,
        handles: vec![run_handle, gateway_handle],
    }
}

/// Client node with a running dispatcher.
pub fn spawn_client(
    bus: &Arc<SimBus>,
    node_id: &str,
    gateway_node_id: &str,
    spool_path: &std::path::Path,
    opts: NodeOptions,
) -> (TestNode, Client) {
    let (dispatcher, requests) = build_node(bus, node_id, spool_path, &opts, None);
    let run_handle = tokio::spawn(Arc::clone(&dispatcher).run());

    let client = Client::new(
        Arc::clone(&dispatcher),
        ClientConfig {
            gateway_node_id: gateway_node_id.to_owned(),
            timeout: opts.timeout,
            absolute_timeout: opts.absolute_timeout,
        },
    );
    let node = TestNode {
        node_id: node_id.to_owned(),
        dispatcher,
        dedupe: None,
        requests: Some(requests),
        handles: vec![run_handle],
    };
    (node, client)
}

/// Poll `check` until it passes or the deadline hits.
pub async fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Payload string that zstd cannot meaningfully compress (64 uniformly
/// distributed symbols, ~6 bits of entropy per char), sized to force a
/// multi-chunk train.
pub fn incompressible(len: usize) -> String {
    (0..len as u64)
        .map(|i| {
            let hash = i.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            char::from(b'0' + (hash >> 58) as u8)
        })
        .collect()
}
