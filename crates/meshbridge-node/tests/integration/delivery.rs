//! End-to-end delivery: single-chunk echo, lossy multi-chunk transfers,
//! NACK-driven repair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meshbridge_node::{LossPolicy, SimBus};
use meshbridge_protocol::frame::parse_chunk;
use meshbridge_protocol::EnvelopeKind;
use serde_json::json;

use crate::harness::{incompressible, spawn_client, spawn_gateway, wait_for, MockExecutor, NodeOptions};

#[tokio::test]
async fn test_single_chunk_echo_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let bus = SimBus::new();
    let executor = Arc::new(MockExecutor::default());
    let gateway = spawn_gateway(&bus, "gateway", &dir.path().join("gw.json"), Arc::clone(&executor));
    let (client_node, client) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &dir.path().join("client.json"),
        NodeOptions::default(),
    );

    let response = client.send_request("test_echo", json!({"x": 1})).await.unwrap();
    assert_eq!(response.kind, EnvelopeKind::Response);
    assert_eq!(response.data["result"]["echo"], json!({"x": 1}));
    assert_eq!(executor.call_count(), 1);

    // End-to-end acks drain both spools.
    wait_for("spools to drain", Duration::from_secs(15), || {
        client_node.spool_depth() == 0 && gateway.spool_depth() == 0
    })
    .await;

    client_node.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_dropped_chunk_recovered_via_nack() {
    let dir = tempfile::tempdir().unwrap();

    // Drop exactly one data chunk (sequence 3) of the response train.
    let tripped = Arc::new(AtomicBool::new(false));
    let trip = Arc::clone(&tripped);
    let bus = SimBus::with_loss(
        LossPolicy::Custom(Box::new(move |_, destination, frame| {
            if destination != "client-1" {
                return false;
            }
            let Ok((header, _)) = parse_chunk(frame) else {
                return false;
            };
            header.flags == 0
                && header.seq == 3
                && header.total > 3
                && !trip.swap(true, Ordering::SeqCst)
        })),
        Duration::ZERO,
    );

    let executor = Arc::new(MockExecutor::default());
    let gateway = spawn_gateway(&bus, "gateway", &dir.path().join("gw.json"), Arc::clone(&executor));
    let (client_node, client) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &dir.path().join("client.json"),
        NodeOptions::default(),
    );

    // Response echoes the payload back, so the response train is the long one.
    let blob = incompressible(1100);
    let response = client
        .send_request("test_echo", json!({"blob": blob}))
        .await
        .unwrap();

    assert!(tripped.load(Ordering::SeqCst), "loss predicate never fired");
    assert_eq!(bus.frames_dropped(), 1);
    assert_eq!(response.kind, EnvelopeKind::Response);
    assert_eq!(response.data["result"]["echo"]["blob"], json!(blob));

    client_node.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_multi_chunk_transfer_survives_random_loss() {
    let dir = tempfile::tempdir().unwrap();
    let bus = SimBus::with_loss(LossPolicy::Percent(10), Duration::ZERO);

    let executor = Arc::new(MockExecutor::default());
    let gateway = spawn_gateway(&bus, "gateway", &dir.path().join("gw.json"), Arc::clone(&executor));
    let (client_node, client) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &dir.path().join("client.json"),
        NodeOptions {
            retries: 5,
            timeout: Duration::from_secs(60),
            absolute_timeout: Duration::from_secs(120),
        },
    );

    let blob = incompressible(800);
    let response = client
        .send_request("test_echo", json!({"blob": blob}))
        .await
        .unwrap();
    assert_eq!(response.data["result"]["echo"]["blob"], json!(blob));

    client_node.shutdown().await;
    gateway.shutdown().await;
}
