use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::api::{
    JobListResponse, ListJobsQuery, ProcessorListResponse, SubmitJobRequest, SubmitJobResponse,
};
use crate::models::job::Job;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// POST /api/v1/jobs — Validate and enqueue an image job.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let job = state
        .submitter
        .submit(request.params, request.input, &request_id(&headers))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitJobResponse {
            job_id: job.id,
            status: job.status,
            message: "Job queued for processing".to_string(),
        }),
    ))
}

/// GET /api/v1/jobs/{job_id} — Full job record.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.store.get(&job_id).await?))
}

/// GET /api/v1/jobs — Filtered, paginated job listing.
pub async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<JobListResponse>, ApiError> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let jobs = state.store.list(&query.into_filter()).await?;
    Ok(Json(JobListResponse {
        count: jobs.len(),
        jobs,
    }))
}

/// DELETE /api/v1/jobs/{job_id}
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete(&job_id).await?;
    tracing::info!(job_id = %job_id, "Job deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/processors
pub async fn list_processors(State(state): State<AppState>) -> Json<ProcessorListResponse> {
    Json(ProcessorListResponse {
        processors: state.registry.list(),
    })
}
