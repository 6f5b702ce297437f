//! Gateway dedupe: duplicate requests execute once, divergent payloads are
//! rejected, acks never surface to application handlers.

use std::sync::Arc;
use std::time::Duration;

use meshbridge_node::SimBus;
use meshbridge_protocol::{Envelope, EnvelopeKind};
use serde_json::json;

use crate::harness::{spawn_client, spawn_gateway, wait_for, MockExecutor, NodeOptions};

#[tokio::test]
async fn test_duplicate_request_executes_once() {
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

    let envelope = Envelope::request("bbbb-2222", "test_echo", json!({"x": 1}));
    let first = client.send_envelope(envelope.clone()).await.unwrap();
    let second = client.send_envelope(envelope).await.unwrap();

    // One HTTP execution; the second response comes from the cache.
    assert_eq!(executor.call_count(), 1);
    assert_eq!(first.kind, EnvelopeKind::Response);
    assert_eq!(first.correlation_id.as_deref(), Some("bbbb-2222"));
    assert_eq!(first.data, second.data);

    client_node.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_reused_id_with_divergent_payload_rejected() {
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

    let good = Envelope::request("cccc-3333", "create_task", json!({"task_id": "t1"}));
    let first = client.send_envelope(good).await.unwrap();
    assert_eq!(first.kind, EnvelopeKind::Response);

    let mutated = Envelope::request("cccc-3333", "create_task", json!({"task_id": "HIJACK"}));
    let second = client.send_envelope(mutated).await.unwrap();
    assert_eq!(second.kind, EnvelopeKind::Error);
    assert!(second.data["error"]
        .as_str()
        .unwrap()
        .contains("divergent"));
    assert_eq!(executor.call_count(), 1);

    client_node.shutdown().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn test_acks_never_reach_application_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let bus = SimBus::new();
    let executor = Arc::new(MockExecutor::default());
    let gateway = spawn_gateway(&bus, "gateway", &dir.path().join("gw.json"), Arc::clone(&executor));
    let (mut client_node, client) = spawn_client(
        &bus,
        "client-1",
        "gateway",
        &dir.path().join("client.json"),
        NodeOptions::default(),
    );

    // A full round trip produces acks in both directions.
    client.send_request("test_echo", json!({})).await.unwrap();
    wait_for("spools to drain", Duration::from_secs(15), || {
        client_node.spool_depth() == 0 && gateway.spool_depth() == 0
    })
    .await;

    // The client's application-visible request queue saw nothing: the
    // inbound acks were consumed by the outbox.
    let requests = client_node.requests.as_mut().unwrap();
    assert!(requests.try_recv().is_err());

    client_node.shutdown().await;
    gateway.shutdown().await;
}
