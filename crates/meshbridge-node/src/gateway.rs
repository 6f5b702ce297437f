//! Gateway role: execute request envelopes against the Atlas HTTP API.
//!
//! Each request passes the dedupe cache first. Hits replay the cached
//! response without touching the API; misses execute under a lease so a
//! concurrent duplicate cannot double-execute.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshbridge_protocol::Envelope;
use meshbridge_reliability::{DedupeCache, DedupeDecision};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::dispatcher::{new_message_id, Dispatcher, InboundRequest};

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("http error: {0}")]
    Http(String),
    #[error("api returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Executes one command against the backing API. Object-safe so tests can
/// inject a mock.
pub trait CommandExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        command: &'a str,
        data: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ExecutorError>> + Send + 'a>>;
}

/// Atlas Command HTTP client: POST /api/v1/commands/<command>.
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpExecutor {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token,
            timeout: Duration::from_secs(30),
        }
    }
}

impl CommandExecutor for HttpExecutor {
    fn execute<'a>(
        &'a self,
        command: &'a str,
        data: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ExecutorError>> + Send + 'a>> {
        Box::pin(async move {
            let url = format!(
                "{}/api/v1/commands/{}",
                self.base_url.trim_end_matches('/'),
                command
            );
            let mut request = self.client.post(&url).json(data).timeout(self.timeout);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            let response = request.send().await.map_err(|e| {
                if e.is_timeout() {
                    ExecutorError::Timeout(self.timeout)
                } else {
                    ExecutorError::Http(e.to_string())
                }
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ExecutorError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            response
                .json()
                .await
                .map_err(|e| ExecutorError::Http(e.to_string()))
        })
    }
}

pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
    dedupe: Arc<DedupeCache>,
    executor: Arc<dyn CommandExecutor>,
}

impl Gateway {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        dedupe: Arc<DedupeCache>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            dispatcher,
            dedupe,
            executor,
        }
    }

    /// Drain delivered requests until shutdown.
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<InboundRequest>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    // Shutdown aborts an in-flight execution; the cancelled
                    // call's response is never spooled.
                    tokio::select! {
                        _ = shutdown.recv() => {
                            tracing::info!("shutdown during request execution, response dropped");
                            break;
                        }
                        _ = self.handle_request(request) => {}
                    }
                }
            }
        }
        tracing::info!("gateway loop stopped");
    }

    pub async fn handle_request(&self, request: InboundRequest) {
        let InboundRequest { sender, envelope } = request;
        let Some(command) = envelope.command.clone() else {
            tracing::warn!(sender, message_id = %envelope.id, "request without command");
            let error = Envelope::error(new_message_id(), envelope.id.as_str(), None, "missing command");
            self.respond(&sender, error).await;
            return;
        };

        let fingerprint = DedupeCache::fingerprint(&command, &envelope.data);
        let now = Instant::now();
        match self.dedupe.check(&envelope.id, Some(&fingerprint), now) {
            DedupeDecision::CachedHit(response) => {
                tracing::info!(
                    sender,
                    message_id = %envelope.id,
                    command,
                    "duplicate request, replaying cached response"
                );
                self.respond(&sender, response).await;
            }
            DedupeDecision::InFlight => {
                // The first copy is still executing; this one evaporates and
                // the client's retry will hit the cache.
                tracing::debug!(
                    sender,
                    message_id = %envelope.id,
                    "duplicate request already in progress, dropped"
                );
            }
            DedupeDecision::Conflict => {
                tracing::warn!(
                    sender,
                    message_id = %envelope.id,
                    command,
                    "request id reused with different payload"
                );
                let error = Envelope::error(
                    new_message_id(),
                    envelope.id.as_str(),
                    Some(command),
                    "duplicate request id with divergent payload",
                );
                self.respond(&sender, error).await;
            }
            DedupeDecision::Execute => {
                self.execute(&sender, &envelope, command, fingerprint).await;
            }
        }
    }

    async fn execute(
        &self,
        sender: &str,
        envelope: &Envelope,
        command: String,
        fingerprint: String,
    ) {
        let started = Instant::now();
        match self.executor.execute(&command, &envelope.data).await {
            Ok(result) => {
                tracing::info!(
                    sender,
                    message_id = %envelope.id,
                    command,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "command executed"
                );
                let response = Envelope::response(
                    new_message_id(),
                    envelope.id.as_str(),
                    Some(command),
                    serde_json::json!({ "result": result }),
                );
                self.dedupe.store(
                    &envelope.id,
                    Some(fingerprint),
                    response.clone(),
                    Instant::now(),
                );
                self.respond(sender, response).await;
            }
            Err(err) => {
                tracing::warn!(
                    sender,
                    message_id = %envelope.id,
                    command,
                    %err,
                    "command execution failed"
                );
                // Failures are not cached: release the lease so a retry
                // executes again.
                self.dedupe.release(&envelope.id);
                let error =
                    Envelope::error(new_message_id(), envelope.id.as_str(), Some(command), err.to_string());
                self.respond(sender, error).await;
            }
        }
    }

    async fn respond(&self, sender: &str, envelope: Envelope) {
        if let Err(err) = self.dispatcher.submit(&envelope, sender).await {
            tracing::error!(
                sender,
                message_id = %envelope.id,
                %err,
                "failed to submit response"
            );
        }
    }
}
