use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod transform;

/// Job API, synchronous transforms and health routes. Middleware and
/// `/metrics` are added by the server binary.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs", get(jobs::list_jobs).post(jobs::submit_job))
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job).delete(jobs::delete_job),
        )
        .route("/api/v1/processors", get(jobs::list_processors))
        .route("/api/v1/crop", post(transform::crop_image))
        .route("/api/v1/resize", post(transform::resize_image))
        .layer(DefaultBodyLimit::max(transform::MAX_UPLOAD_BYTES))
        .with_state(state)
}
