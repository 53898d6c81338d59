// HTTP route handlers for the Sandrun API

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use sandrun_common::types::{ExecutionResult, FailureKind, JobStatus, JobView};
use sandrun_engine::DispatchError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::metrics;
use crate::submitter::JobHandle;
use crate::AppState;

/// Missing fields deserialize as empty and are rejected with the usual message
#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language: String,
}

#[derive(Debug, Serialize)]
pub struct QueuedResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub mode: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DirectResponse {
    pub mode: &'static str,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

fn rejected(e: DispatchError, route: &'static str) -> ApiError {
    let reason = match e.failure_kind() {
        FailureKind::UnsupportedLanguage => "unsupported_language",
        _ => "invalid_request",
    };
    metrics::REJECTIONS.with_label_values(&[reason]).inc();
    warn!(route, reason, error = %e, "Request rejected");
    ApiError::from(e)
}

/// GET / - Service banner
pub async fn home(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "message": "Sandrun code execution service",
        "version": env!("CARGO_PKG_VERSION"),
        "mode": state.submitter.mode(),
        "supported_languages": state.runner.supported_languages(),
    }))
}

/// GET /health - Liveness plus queue reachability
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue = match &state.store {
        Some(store) => match store.ping().await {
            Ok(()) => "connected",
            Err(e) => {
                warn!(error = %e, "Job queue ping failed");
                "disconnected"
            }
        },
        None => "disconnected",
    };
    Json(serde_json::json!({ "status": "ok", "queue": queue }))
}

/// GET /metrics - Prometheus text exposition
pub async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

/// POST /api/execute - Queue a job, or run it inline when the queue is down.
/// 503 when the queue may have stored the job without confirming it.
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Response, ApiError> {
    let handle = state
        .submitter
        .submit(&payload.code, &payload.language)
        .await
        .map_err(|e| match e {
            ApiError::Rejected(e) => rejected(e, "execute"),
            other => other,
        })?;

    Ok(match handle {
        JobHandle::Queued(job_id) => (
            StatusCode::ACCEPTED,
            Json(QueuedResponse {
                job_id,
                status: JobStatus::Pending,
                mode: "queued",
            }),
        )
            .into_response(),
        JobHandle::Inline(result) => (
            StatusCode::OK,
            Json(DirectResponse {
                mode: "direct",
                result,
            }),
        )
            .into_response(),
    })
}

/// POST /api/execute/direct - Always run inline
pub async fn execute_direct(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ExecuteRequest>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let result = state
        .direct
        .execute(&payload.code, &payload.language)
        .await
        .map_err(|e| rejected(e, "execute_direct"))?;

    metrics::SUBMISSIONS.with_label_values(&["direct"]).inc();
    info!(
        execution_id = %result.execution_id,
        status = ?result.status,
        execution_ms = result.duration_ms(),
        "Direct execution finished"
    );
    Ok(Json(result))
}

/// GET /api/job/{job_id} - Poll a queued job
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobView>, ApiError> {
    let id = Uuid::parse_str(&job_id).map_err(|_| ApiError::InvalidJobId(job_id.clone()))?;

    let store = state
        .store
        .as_ref()
        .ok_or_else(|| ApiError::QueueUnavailable("running in direct mode".to_string()))?;

    let job = store.fetch(id).await?.ok_or(ApiError::JobNotFound(id))?;
    info!(job_id = %id, status = %job.status, "Job status retrieved");
    Ok(Json(JobView::from(job)))
}
