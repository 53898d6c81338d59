// Worker health endpoint: pool counters over HTTP

use anyhow::{Context, Result};
use axum::{extract::State, response::Json, routing::get, Router};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::pool::{PoolSnapshot, PoolStats};

#[derive(Clone)]
struct HealthState {
    stats: Arc<PoolStats>,
    workers: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub workers: usize,
    #[serde(flatten)]
    pub pool: PoolSnapshot,
}

pub fn router(stats: Arc<PoolStats>, workers: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState { stats, workers })
}

async fn health(State(state): State<HealthState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        workers: state.workers,
        pool: state.stats.snapshot(),
    })
}

/// Serve `/health` on `addr` until the shutdown flag flips
pub async fn serve(addr: String, stats: Arc<PoolStats>, workers: usize, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint to {}", addr))?;
    info!("Health endpoint listening on {}", addr);

    axum::serve(listener, router(stats, workers))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("Health server error")
}
