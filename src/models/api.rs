use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::job::{Job, JobInput, JobParams, JobStatus};
use crate::services::job_store::JobFilter;

/// Default page size for `GET /api/v1/jobs` when no limit is given.
const DEFAULT_LIST_LIMIT: usize = 50;

/// Upper bound on the page size a client may request.
const MAX_LIST_LIMIT: usize = 500;

/// Request to submit an image job.
///
/// The body mirrors the job wire format: `type` and `parameters` select the
/// operation, `input` references bytes already uploaded to object storage.
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(flatten)]
    pub params: JobParams,
    pub input: JobInput,
}

/// Response after submitting a job.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

/// Query string for listing jobs.
#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<JobStatus>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListJobsQuery {
    pub fn into_filter(self) -> JobFilter {
        JobFilter {
            status: self.status,
            job_type: self.job_type,
            since: self.since,
            until: self.until,
            limit: Some(self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)),
            offset: self.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessorListResponse {
    pub processors: Vec<String>,
}
