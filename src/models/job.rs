use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use uuid::Uuid;

/// Smallest accepted output dimension, in pixels.
pub const MIN_IMAGE_DIMENSION: i64 = 1;

/// Largest accepted output dimension, in pixels.
pub const MAX_IMAGE_DIMENSION: i64 = 10_000;

/// Status of an image job in the async pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `processing -> processing` is allowed so that a redelivered job can
    /// re-enter processing without changing its externally visible status.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

/// Crop rectangle. Coordinates are signed so that negative input reaches
/// validation instead of failing deserialization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct CropParams {
    #[garde(range(min = 0))]
    pub x: i64,
    #[garde(range(min = 0))]
    pub y: i64,
    #[garde(range(min = MIN_IMAGE_DIMENSION, max = MAX_IMAGE_DIMENSION))]
    pub width: i64,
    #[garde(range(min = MIN_IMAGE_DIMENSION, max = MAX_IMAGE_DIMENSION))]
    pub height: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ResizeParams {
    #[garde(range(min = MIN_IMAGE_DIMENSION, max = MAX_IMAGE_DIMENSION))]
    pub width: i64,
    #[garde(range(min = MIN_IMAGE_DIMENSION, max = MAX_IMAGE_DIMENSION))]
    pub height: i64,
}

/// Operation-specific parameters, discriminated by the job's `type` field.
///
/// Serialized adjacently tagged so that a job carries `"type": "crop"` and
/// `"parameters": {...}` as sibling fields.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum JobParams {
    Crop(CropParams),
    Resize(ResizeParams),
}

impl JobParams {
    /// Operation name, used as the processor registry key.
    pub fn kind(&self) -> &'static str {
        match self {
            JobParams::Crop(_) => "crop",
            JobParams::Resize(_) => "resize",
        }
    }
}

/// Reference to the source bytes in object storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobInput {
    pub storage_key: String,
    pub mime_type: String,
    pub size: u64,
}

/// Reference to the output bytes of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResult {
    pub storage_key: String,
    pub mime_type: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub request_id: String,
}

/// An image processing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    #[serde(rename = "job_id")]
    pub id: String,
    #[serde(flatten)]
    pub params: JobParams,
    pub status: JobStatus,
    pub input: JobInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: JobMetadata,
}

impl Job {
    /// Build a fresh `queued` job with a newly generated id.
    pub fn new(params: JobParams, input: JobInput, request_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            params,
            status: JobStatus::Queued,
            input,
            result: None,
            error: None,
            metadata: JobMetadata {
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
                retry_count: 0,
                request_id: request_id.into(),
            },
        }
    }

    /// Operation name of this job (the `type` field on the wire).
    pub fn job_type(&self) -> &'static str {
        self.params.kind()
    }

    /// Apply a state machine transition, keeping `result`/`error` and the
    /// lifecycle timestamps consistent with the new status.
    pub fn transition(
        &mut self,
        next: JobStatus,
        result: Option<JobResult>,
        error: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError::NotAllowed {
                from: self.status,
                to: next,
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Completed => {
                let result = result.ok_or(TransitionError::MissingResult)?;
                self.result = Some(result);
                self.error = None;
                self.metadata.completed_at = Some(now);
            }
            JobStatus::Failed => {
                let error = error
                    .filter(|e| !e.trim().is_empty())
                    .ok_or(TransitionError::MissingError)?;
                self.result = None;
                self.error = Some(error);
                self.metadata.completed_at = Some(now);
            }
            JobStatus::Processing => {
                self.result = None;
                self.error = None;
                self.metadata.started_at = Some(now);
            }
            JobStatus::Queued => {
                self.result = None;
                self.error = None;
            }
        }

        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Invalid status transition from {from} to {to}")]
    NotAllowed { from: JobStatus, to: JobStatus },

    #[error("A completed job must carry a result")]
    MissingResult,

    #[error("A failed job must carry a non-empty error message")]
    MissingError,
}
