//! Status API -- health, readiness, transport counters and Prometheus
//! exposition over HTTP.
//!
//! Bound only when `status_addr` is configured. Deliberately read-only:
//! all mutation happens over the radio or the Atlas HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use meshbridge_reliability::DedupeCache;
use tokio::sync::broadcast;

use crate::dispatcher::Dispatcher;
use crate::metrics::render_gauge;

/// Spool depth above which readiness flips to 503.
const READY_SPOOL_LIMIT: usize = 1000;

pub struct AppState {
    pub role: &'static str,
    pub dispatcher: Arc<Dispatcher>,
    pub dedupe: Option<Arc<DedupeCache>>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    if state.dispatcher.spool().depth() < READY_SPOOL_LIMIT {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "spool backlog")
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let mut body = serde_json::json!({
        "role": state.role,
        "node_id": state.dispatcher.node_id(),
        "spool_depth": state.dispatcher.spool().depth(),
        "reassembly": state.dispatcher.reassembly_stats(),
        "counters": state.dispatcher.metrics().snapshot(),
    });
    if let Some(dedupe) = &state.dedupe {
        body["dedupe"] = serde_json::to_value(dedupe.stats()).unwrap_or_default();
    }
    Json(body)
}

/// Prometheus text exposition: transport counters plus gauges read from
/// the live structures.
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = state.dispatcher.metrics().render_prometheus();

    render_gauge(
        &mut body,
        "meshbridge_spool_depth",
        "Pending spool records awaiting ack",
        state.dispatcher.spool().depth() as u64,
    );
    let reassembly = state.dispatcher.reassembly_stats();
    render_gauge(
        &mut body,
        "meshbridge_reassembly_buckets",
        "Partial reassembly buckets held",
        reassembly.buckets as u64,
    );
    render_gauge(
        &mut body,
        "meshbridge_reassembly_chunks_buffered",
        "Chunks buffered across all buckets",
        reassembly.chunks_buffered as u64,
    );
    if let Some(dedupe) = &state.dedupe {
        let stats = dedupe.stats();
        render_gauge(
            &mut body,
            "meshbridge_dedupe_entries",
            "Cached responses in the dedupe cache",
            stats.entries as u64,
        );
        render_gauge(
            &mut body,
            "meshbridge_dedupe_leases",
            "Executions currently holding a dedupe lease",
            stats.leases as u64,
        );
    }

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// Serve until the shutdown channel fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;
    Ok(())
}
