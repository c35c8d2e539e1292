//! Synchronous transforms: the uploaded image is processed inline and the
//! result is returned as a JPEG response body. No job record is created.

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Multipart, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use image::ImageFormat;

use crate::app_state::AppState;
use crate::error::ApiError;
use crate::models::job::{CropParams, JobParams, ResizeParams};
use crate::services::pipeline::{encode, PipelineError};
use crate::services::processors::ProcessorError;

/// Largest accepted request body, multipart overhead included.
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

/// Multipart field carrying the source image.
pub const IMAGE_FIELD: &str = "image";

/// POST /api/v1/crop?x=&y=&width=&height= — Crop an uploaded image.
pub async fn crop_image(
    State(state): State<AppState>,
    query: Result<Query<CropParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    transform(&state, JobParams::Crop(params), multipart).await
}

/// POST /api/v1/resize?width=&height= — Resize an uploaded image.
pub async fn resize_image(
    State(state): State<AppState>,
    query: Result<Query<ResizeParams>, QueryRejection>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    transform(&state, JobParams::Resize(params), multipart).await
}

async fn transform(
    state: &AppState,
    params: JobParams,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, ApiError> {
    let processor = state.registry.get(params.kind()).map_err(PipelineError::from)?;
    processor
        .validate_params(&params)
        .map_err(PipelineError::from)?;

    let mut multipart = multipart.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let upload = read_image(&mut multipart).await?;
    let upload_bytes = upload.len();

    // Decoding and resampling are CPU bound.
    let encoded = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, ApiError> {
        let source = image::load_from_memory(&upload)
            .map_err(|e| ApiError::bad_request(format!("Invalid image format: {}", e)))?;
        let output = processor
            .process(&source, &params)
            .map_err(PipelineError::from)?;
        encode(&output, ImageFormat::Jpeg).map_err(|e| processing_failed(e.to_string()))
    })
    .await
    .map_err(|e| processing_failed(e.to_string()))??;

    tracing::info!(
        processor = params.kind(),
        upload_bytes,
        output_bytes = encoded.len(),
        "Image transformed"
    );
    Ok(([(header::CONTENT_TYPE, "image/jpeg")], encoded).into_response())
}

async fn read_image(multipart: &mut Multipart) -> Result<Bytes, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.body_text()))?
    {
        if field.name() == Some(IMAGE_FIELD) {
            return field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(e.body_text()));
        }
    }
    Err(ApiError::bad_request("No image file provided"))
}

fn processing_failed(message: String) -> ApiError {
    PipelineError::Processor(ProcessorError::ProcessingFailed(message)).into()
}
