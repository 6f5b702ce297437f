//! Spool durability: oversize rejection, restart replay, retry exhaustion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use meshbridge_node::{NodeError, SimBus};
use meshbridge_protocol::{Envelope, ProtocolError};
use meshbridge_reliability::DedupeDecision;
use meshbridge_spool::SpoolEvent;
use serde_json::json;

use crate::harness::{incompressible, spawn_client, spawn_gateway, wait_for, MockExecutor, NodeOptions};

#[tokio::test]
async fn test_oversize_payload_rejected_before_wire() {
    let dir = tempfile::tempdir().unwrap();
    let bus = SimBus::new();
    let (client_node, client) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &dir.path().join("client.json"),
        NodeOptions::default(),
    );

    // Enough incompressible data to encode past the 10 KB ceiling.
    let err = client
        .send_request("create_object", json!({"content_b64": incompressible(20 * 1024)}))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NodeError::Protocol(ProtocolError::PayloadTooLarge { .. })
    ));

    // Nothing persisted, nothing transmitted.
    assert_eq!(client_node.spool_depth(), 0);
    assert_eq!(bus.frames_sent(), 0);

    client_node.shutdown().await;
}

#[tokio::test]
async fn test_restart_replays_unacked_request_with_same_id() {
    let dir = tempfile::tempdir().unwrap();
    let spool_path = dir.path().join("client.json");
    let bus = SimBus::new();

    // Phase 1: no gateway on the air. The send times out but the spool
    // keeps the record.
    let (node, client) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &spool_path,
        NodeOptions {
            retries: 2,
            timeout: Duration::from_millis(300),
            absolute_timeout: Duration::from_secs(1),
        },
    );
    let envelope = Envelope::request("rst-0001", "test_echo", json!({"n": 1}));
    let err = client.send_envelope(envelope).await.unwrap_err();
    assert!(matches!(err, NodeError::Timeout { .. }));
    assert_eq!(node.spool_depth(), 1);

    // Crash before any ack.
    node.shutdown().await;

    // Phase 2: restart against a live gateway. The sweeper replays the
    // spooled request with its original id.
    let executor = Arc::new(MockExecutor::default());
    let gateway = spawn_gateway(&bus, "gateway", &dir.path().join("gw.json"), Arc::clone(&executor));
    let (node2, _client2) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &spool_path,
        NodeOptions::default(),
    );

    wait_for("replayed request to execute", Duration::from_secs(20), || {
        executor.call_count() >= 1
    })
    .await;
    let calls = executor.calls();
    assert_eq!(calls[0].0, "test_echo");
    assert_eq!(calls[0].1, json!({"n": 1}));

    // The gateway saw the original id: its dedupe cache answers for it.
    wait_for("client spool to drain", Duration::from_secs(20), || {
        node2.spool_depth() == 0
    })
    .await;
    let dedupe = gateway.dedupe.as_ref().unwrap();
    assert!(matches!(
        dedupe.check("rst-0001", None, Instant::now()),
        DedupeDecision::CachedHit(_)
    ));

    node2.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_retry_exhaustion_surfaces_delivery_failed() {
    let dir = tempfile::tempdir().unwrap();
    let bus = SimBus::new();
    let (node, client) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &dir.path().join("client.json"),
        NodeOptions {
            retries: 0,
            timeout: Duration::from_millis(300),
            absolute_timeout: Duration::from_secs(1),
        },
    );
    let mut events = node.dispatcher.spool().subscribe();

    let err = client.send_request("test_echo", json!({})).await.unwrap_err();
    assert!(matches!(err, NodeError::Timeout { .. }));

    // With zero retries the record is dropped once its only attempt's
    // backoff window passes without an ack.
    wait_for("spool to give up", Duration::from_secs(20), || {
        node.spool_depth() == 0
    })
    .await;
    match events.recv().await.unwrap() {
        SpoolEvent::DeliveryFailed { destination, .. } => assert_eq!(destination, "gateway"),
    }

    node.shutdown().await;
}
