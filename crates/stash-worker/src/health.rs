use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::{json, Value};
use stash_kernel::WorkerMetrics;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn build_router(metrics: Arc<WorkerMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .with_state(metrics)
        .layer(TraceLayer::new_for_http())
}

/// Serves `/healthz` and `/metrics` until the listener fails. Counters are
/// exported over OTLP as well; `/metrics` is the local view of the same tally.
pub async fn serve(addr: SocketAddr, metrics: Arc<WorkerMetrics>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind health listener on {addr}"))?;
    info!(%addr, "health endpoint listening");
    axum::serve(listener, build_router(metrics))
        .await
        .context("health server exited")
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn render_metrics(State(metrics): State<Arc<WorkerMetrics>>) -> Json<Value> {
    let snapshot = metrics.snapshot();
    Json(json!({
        "counters": snapshot.counters,
        "invalidation_cursor_ms": snapshot.invalidation_cursor,
    }))
}
