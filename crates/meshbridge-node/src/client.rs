//! Client role: issue requests to the gateway and wait for responses.
//!
//! Request ids are client-generated and globally unique; retries reuse the
//! same id so the gateway's dedupe holds. A timed-out call surfaces
//! `Timeout` to the caller, but the spool keeps retrying in the background
//! until its own schedule is exhausted.

use std::sync::Arc;
use std::time::Duration;

use meshbridge_protocol::{Envelope, EnvelopeKind};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::dispatcher::{new_message_id, Dispatcher};
use crate::NodeError;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub gateway_node_id: String,
    /// Progress-resetting wait; resets on any inbound frame for the request.
    pub timeout: Duration,
    /// Hard cap on one wait regardless of progress.
    pub absolute_timeout: Duration,
}

impl ClientConfig {
    pub fn new(gateway_node_id: impl Into<String>) -> Self {
        Self {
            gateway_node_id: gateway_node_id.into(),
            timeout: Duration::from_secs(90),
            absolute_timeout: Duration::from_secs(150),
        }
    }
}

pub struct Client {
    dispatcher: Arc<Dispatcher>,
    cfg: ClientConfig,
}

impl Client {
    pub fn new(dispatcher: Arc<Dispatcher>, cfg: ClientConfig) -> Self {
        Self { dispatcher, cfg }
    }

    /// Build and send a request, then wait for its response or error
    /// envelope.
    pub async fn send_request(&self, command: &str, data: Value) -> Result<Envelope, NodeError> {
        let envelope = Envelope::request(new_message_id(), command, data);
        self.send_envelope(envelope).await
    }

    /// Send a prepared request envelope and wait on the correlation-id
    /// rendezvous with a progress-resetting timeout and an absolute cap.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<Envelope, NodeError> {
        if envelope.kind != EnvelopeKind::Request {
            return Err(NodeError::InvalidRequest(format!(
                "client sends request envelopes, not {}",
                envelope.kind
            )));
        }
        let message_id = envelope.id.clone();
        let prefix = envelope.prefix();

        let mut response_rx = self.dispatcher.register_waiter(&message_id);
        let mut progress_rx = self.dispatcher.subscribe_progress();

        // Flush anything the spool still owes before issuing a new send.
        if let Err(err) = self.dispatcher.flush_outbox().await {
            tracing::warn!(%err, "outbox flush before send failed");
        }

        tracing::info!(
            message_id = %message_id,
            command = envelope.command.as_deref().unwrap_or("unknown"),
            destination = %self.cfg.gateway_node_id,
            "sending request"
        );
        if let Err(err) = self
            .dispatcher
            .submit(&envelope, &self.cfg.gateway_node_id)
            .await
        {
            self.dispatcher.cancel_waiter(&message_id);
            return Err(err);
        }

        let started = Instant::now();
        let absolute_deadline = started + self.cfg.absolute_timeout;
        let mut progress_deadline = started + self.cfg.timeout;

        loop {
            let deadline = progress_deadline.min(absolute_deadline);
            tokio::select! {
                response = &mut response_rx => {
                    return match response {
                        Ok(envelope) => {
                            tracing::info!(
                                message_id = %message_id,
                                kind = %envelope.kind,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "response accepted"
                            );
                            Ok(envelope)
                        }
                        Err(_) => Err(NodeError::Transport(
                            "dispatcher dropped the response channel".into(),
                        )),
                    };
                }
                event = progress_rx.recv() => {
                    if let Ok(event) = event {
                        if event.prefix == prefix {
                            tracing::debug!(
                                message_id = %message_id,
                                control = event.is_control,
                                "progress observed, resetting wait timer"
                            );
                            progress_deadline = Instant::now() + self.cfg.timeout;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.dispatcher.cancel_waiter(&message_id);
                    tracing::warn!(
                        message_id = %message_id,
                        elapsed_secs = started.elapsed().as_secs(),
                        "timed out waiting for response, background retry continues"
                    );
                    return Err(NodeError::Timeout { message_id });
                }
            }
        }
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    pub async fn test_echo(&self, message: Value) -> Result<Envelope, NodeError> {
        self.send_request("test_echo", json!({ "message": message }))
            .await
    }

    pub async fn health_check(&self) -> Result<Envelope, NodeError> {
        self.send_request("health_check", json!({})).await
    }

    pub async fn list_entities(&self, limit: u32, offset: u32) -> Result<Envelope, NodeError> {
        self.send_request("list_entities", json!({ "limit": limit, "offset": offset }))
            .await
    }

    pub async fn get_entity(&self, entity_id: &str) -> Result<Envelope, NodeError> {
        if entity_id.is_empty() {
            return Err(NodeError::InvalidRequest(
                "get_entity requires 'entity_id'".into(),
            ));
        }
        self.send_request("get_entity", json!({ "entity_id": entity_id }))
            .await
    }

    pub async fn create_task(
        &self,
        task_id: &str,
        status: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<Envelope, NodeError> {
        if task_id.is_empty() {
            return Err(NodeError::InvalidRequest(
                "create_task requires 'task_id'".into(),
            ));
        }
        let mut data = json!({ "task_id": task_id });
        if let Some(status) = status {
            data["status"] = json!(status);
        }
        if let Some(entity_id) = entity_id {
            data["entity_id"] = json!(entity_id);
        }
        self.send_request("create_task", data).await
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        result: Option<Value>,
    ) -> Result<Envelope, NodeError> {
        if task_id.is_empty() {
            return Err(NodeError::InvalidRequest(
                "complete_task requires 'task_id'".into(),
            ));
        }
        let mut data = json!({ "task_id": task_id });
        if let Some(result) = result {
            data["result"] = result;
        }
        self.send_request("complete_task", data).await
    }

    pub async fn get_changed_since(
        &self,
        since: &str,
        limit_per_type: Option<u32>,
    ) -> Result<Envelope, NodeError> {
        if since.is_empty() {
            return Err(NodeError::InvalidRequest(
                "get_changed_since requires 'since'".into(),
            ));
        }
        let mut data = json!({ "since": since });
        if let Some(limit) = limit_per_type {
            data["limit_per_type"] = json!(limit);
        }
        self.send_request("get_changed_since", data).await
    }
}
