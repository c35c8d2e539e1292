use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::services::job_store::StoreError;
use crate::services::pipeline::PipelineError;
use crate::services::processors::ProcessorError;
use crate::services::queue::QueueError;

/// Error returned by route handlers, rendered as
/// `{"error": <code>, "message": <text>}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Store(e) => store_status(e),
            ApiError::Pipeline(PipelineError::Store(e)) => store_status(e),
            ApiError::Pipeline(PipelineError::Processor(e)) => match e {
                ProcessorError::NotFound(_) => (StatusCode::NOT_FOUND, "processor_not_found"),
                ProcessorError::ValidationFailed(_) => {
                    (StatusCode::BAD_REQUEST, "validation_failed")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "processor_error"),
            },
            ApiError::Pipeline(PipelineError::Queue(e)) => match e {
                QueueError::Closed => (StatusCode::SERVICE_UNAVAILABLE, "queue_unavailable"),
                _ => (StatusCode::BAD_GATEWAY, "publish_failed"),
            },
        }
    }
}

fn store_status(err: &StoreError) -> (StatusCode, &'static str) {
    match err {
        StoreError::NotFound(_) => (StatusCode::NOT_FOUND, "job_not_found"),
        StoreError::AlreadyExists(_) => (StatusCode::CONFLICT, "job_exists"),
        StoreError::Transition(_) => (StatusCode::CONFLICT, "invalid_transition"),
        StoreError::Finished(_) => (StatusCode::CONFLICT, "job_finished"),
        StoreError::Unavailable(_) | StoreError::Closed => {
            (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
        }
        StoreError::Serialize(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "Request failed");
        }
        (
            status,
            Json(json!({
                "error": code,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
