//! Submission and execution of image jobs.
//!
//! [`JobSubmitter`] is the producer side used by the HTTP API: it validates a
//! request against the processor registry, records the job as `queued` and
//! publishes it. [`JobExecutor`] is the consumer side: a [`JobHandler`] that
//! drives a delivered job through `processing` to `completed` or `failed`.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, ImageFormat};

use crate::models::job::{Job, JobInput, JobParams, JobResult, JobStatus};
use crate::services::job_store::{JobStore, StoreError};
use crate::services::processors::{ProcessorError, ProcessorRegistry};
use crate::services::queue::{HandlerError, JobHandler, JobPublisher, QueueError};
use crate::services::storage::ObjectStorage;

pub struct JobSubmitter {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn JobPublisher>,
    registry: Arc<ProcessorRegistry>,
}

impl JobSubmitter {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn JobPublisher>,
        registry: Arc<ProcessorRegistry>,
    ) -> Self {
        Self {
            store,
            publisher,
            registry,
        }
    }

    /// Validate, persist and enqueue a new job.
    ///
    /// If publishing fails the stored record is removed again so no `queued`
    /// job is left without a message.
    pub async fn submit(
        &self,
        params: JobParams,
        input: JobInput,
        request_id: &str,
    ) -> Result<Job, PipelineError> {
        let processor = self.registry.get(params.kind())?;
        processor.validate_params(&params)?;

        let mut job = Job::new(params, input, request_id);
        self.store.create(&mut job).await?;

        if let Err(e) = self.publisher.publish(&job).await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to publish job");
            if let Err(cleanup) = self.store.delete(&job.id).await {
                tracing::warn!(job_id = %job.id, error = %cleanup, "Failed to remove unpublished job");
            }
            return Err(e.into());
        }

        metrics::counter!("image_jobs_submitted_total", "type" => job.job_type()).increment(1);
        tracing::info!(
            job_id = %job.id,
            job_type = job.job_type(),
            request_id = %job.metadata.request_id,
            "Job submitted"
        );
        Ok(job)
    }
}

/// Runs delivered jobs against the processor registry.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<ProcessorRegistry>,
    storage: Arc<dyn ObjectStorage>,
    max_retry: u32,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<ProcessorRegistry>,
        storage: Arc<dyn ObjectStorage>,
        max_retry: u32,
    ) -> Self {
        Self {
            store,
            registry,
            storage,
            max_retry,
        }
    }

    /// Fetch the input, run the processor and store the output.
    async fn execute(&self, job: &Job) -> Result<JobResult, HandlerError> {
        let processor = self
            .registry
            .get(job.job_type())
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;
        processor
            .validate_params(&job.params)
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;

        let bytes = self
            .storage
            .download(&job.input.storage_key)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        let input_format = ImageFormat::from_mime_type(&job.input.mime_type);
        let source = match input_format {
            Some(format) => image::load_from_memory_with_format(&bytes, format),
            None => image::load_from_memory(&bytes),
        }
        .map_err(|e| HandlerError::Permanent(format!("failed to decode input image: {}", e)))?;

        let output = processor
            .process(&source, &job.params)
            .map_err(|e| match e {
                ProcessorError::ValidationFailed(_) => HandlerError::Permanent(e.to_string()),
                other => HandlerError::Retryable(other.to_string()),
            })?;

        let format = output_format(input_format);
        let encoded = encode(&output, format)
            .map_err(|e| HandlerError::Permanent(format!("failed to encode output image: {}", e)))?;
        let (width, height) = output.dimensions();
        let storage_key = result_key(&job.id, format);
        let mime_type = format.to_mime_type().to_string();

        self.storage
            .upload(&storage_key, &encoded, &mime_type)
            .await
            .map_err(|e| HandlerError::Retryable(e.to_string()))?;

        Ok(JobResult {
            storage_key,
            mime_type,
            size: encoded.len() as u64,
            width,
            height,
        })
    }
}

#[async_trait]
impl JobHandler for JobExecutor {
    async fn handle(&self, job: Job) -> Result<(), HandlerError> {
        let started = Instant::now();
        let retry_count = job.metadata.retry_count;

        let mut current = match self.store.get(&job.id).await {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => {
                tracing::info!(job_id = %job.id, "Job record no longer exists, skipping");
                return Ok(());
            }
            Err(e) => return Err(HandlerError::Retryable(e.to_string())),
        };

        if current.status.is_terminal() {
            tracing::debug!(job_id = %current.id, status = %current.status, "Duplicate delivery of finished job");
            return Ok(());
        }

        current.metadata.retry_count = retry_count;
        current
            .transition(JobStatus::Processing, None, None)
            .map_err(|e| HandlerError::Permanent(e.to_string()))?;
        match self.store.update(&mut current).await {
            Ok(()) => {}
            Err(StoreError::Finished(_)) => {
                tracing::debug!(job_id = %current.id, "Job finished by a concurrent delivery");
                return Ok(());
            }
            Err(e) => return Err(HandlerError::Retryable(e.to_string())),
        }

        tracing::info!(
            job_id = %current.id,
            job_type = current.job_type(),
            retry_count,
            "Processing job"
        );

        let job_type = current.job_type();
        match self.execute(&current).await {
            Ok(result) => {
                let (width, height) = (result.width, result.height);
                match self
                    .store
                    .update_status(&current.id, JobStatus::Completed, Some(result), None)
                    .await
                {
                    Ok(_) => {}
                    Err(StoreError::Finished(_) | StoreError::Transition(_)) => {
                        tracing::debug!(job_id = %current.id, "Job finished by a concurrent delivery");
                        return Ok(());
                    }
                    Err(e) => return Err(HandlerError::Retryable(e.to_string())),
                }

                metrics::counter!("image_jobs_completed_total", "type" => job_type).increment(1);
                metrics::histogram!("image_job_processing_seconds", "type" => job_type)
                    .record(started.elapsed().as_secs_f64());
                tracing::info!(
                    job_id = %current.id,
                    width,
                    height,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                Ok(())
            }
            Err(failure) => {
                let is_final =
                    matches!(failure, HandlerError::Permanent(_)) || retry_count >= self.max_retry;
                if is_final {
                    let message = failure.to_string();
                    if let Err(e) = self
                        .store
                        .update_status(&current.id, JobStatus::Failed, None, Some(message))
                        .await
                    {
                        tracing::error!(job_id = %current.id, error = %e, "Failed to record job failure");
                    }
                    metrics::counter!("image_jobs_failed_total", "type" => job_type).increment(1);
                    tracing::warn!(job_id = %current.id, retry_count, error = %failure, "Job failed");
                } else {
                    tracing::info!(job_id = %current.id, retry_count, error = %failure, "Job attempt failed, will retry");
                }
                Err(failure)
            }
        }
    }

    /// Record the job as failed when its message is dead-lettered without
    /// being handled.
    async fn exhausted(&self, job: Job, reason: &str) {
        let mut current = match self.store.get(&job.id).await {
            Ok(current) => current,
            Err(StoreError::NotFound(_)) => return,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to load exhausted job");
                return;
            }
        };
        if current.status.is_terminal() {
            return;
        }

        current.metadata.retry_count = job.metadata.retry_count;
        // A job whose every delivery was lost may never have left `queued`.
        let failed = if current.status == JobStatus::Queued {
            current
                .transition(JobStatus::Processing, None, None)
                .and_then(|()| current.transition(JobStatus::Failed, None, Some(reason.to_string())))
        } else {
            current.transition(JobStatus::Failed, None, Some(reason.to_string()))
        };
        if let Err(e) = failed {
            tracing::error!(job_id = %current.id, error = %e, "Cannot mark exhausted job failed");
            return;
        }

        match self.store.update(&mut current).await {
            Ok(()) => {
                metrics::counter!("image_jobs_failed_total", "type" => current.job_type())
                    .increment(1);
                tracing::warn!(
                    job_id = %current.id,
                    retry_count = current.metadata.retry_count,
                    error = reason,
                    "Job failed"
                );
            }
            Err(StoreError::Finished(_)) => {}
            Err(e) => {
                tracing::error!(job_id = %current.id, error = %e, "Failed to record job failure")
            }
        }
    }
}

/// Outputs keep the input's format when it can be encoded, PNG otherwise.
fn output_format(input: Option<ImageFormat>) -> ImageFormat {
    match input {
        Some(format @ (ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP)) => format,
        _ => ImageFormat::Png,
    }
}

fn result_key(job_id: &str, format: ImageFormat) -> String {
    let ext = format.extensions_str().first().copied().unwrap_or("png");
    format!("results/{}.{}", job_id, ext)
}

pub(crate) fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Cursor::new(Vec::new());
    match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut buf, format)?,
        ImageFormat::WebP => DynamicImage::ImageRgba8(image.to_rgba8()).write_to(&mut buf, format)?,
        _ => image.write_to(&mut buf, format)?,
    }
    Ok(buf.into_inner())
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
