// HTTP-facing errors. Every error body is `{"status": "failure", "error": "..."}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use sandrun_common::error::StoreError;
use sandrun_engine::DispatchError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] DispatchError),

    #[error("Invalid job ID format: {0}")]
    InvalidJobId(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::JobNotFound(id),
            e if e.is_unavailable() => ApiError::QueueUnavailable(e.to_string()),
            e => ApiError::Internal(e.to_string()),
        }
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Rejected(_) | ApiError::InvalidJobId(_) => StatusCode::BAD_REQUEST,
            ApiError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "status": "failure",
            "error": self.to_string(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
