use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::handlers;
use crate::AppState;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(handlers::home))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/execute", post(handlers::submit_job))
        .route("/api/execute/direct", post(handlers::execute_direct))
        .route("/api/job/:job_id", get(handlers::get_job))
}
