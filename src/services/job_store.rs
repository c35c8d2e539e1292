use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use tracing::{debug, instrument, warn};

use crate::models::job::{Job, JobResult, JobStatus, TransitionError};

/// Keys fetched per MGET round trip when listing.
const FETCH_BATCH: usize = 200;

/// Keys requested per SCAN step during a full namespace listing.
const SCAN_COUNT: usize = 500;

/// Writes the record and its index entry atomically, refusing to overwrite.
///
/// KEYS[1] = record key, KEYS[2] = status index key
/// ARGV[1] = payload, ARGV[2] = ttl seconds (0 = none), ARGV[3] = job id
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
local ttl = tonumber(ARGV[2])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[1])
end
redis.call('SADD', KEYS[2], ARGV[3])
return 1
"#;

/// Moves the record to its new status unless the stored record has already
/// finished. Returns 1 when the write is refused, 0 otherwise.
///
/// KEYS[1] = record key, KEYS[2] = new status index key
/// ARGV[1] = payload, ARGV[2] = ttl seconds (0 = none), ARGV[3] = job id,
/// ARGV[4] = new status, ARGV[5] = status index key prefix
const UPDATE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
  local ok, record = pcall(cjson.decode, current)
  if ok and type(record) == 'table' and type(record['status']) == 'string' then
    local status = record['status']
    if status == 'completed' or status == 'failed' then
      return 1
    end
    if status ~= ARGV[4] then
      redis.call('SREM', ARGV[5] .. status, ARGV[3])
    end
  end
end
local ttl = tonumber(ARGV[2])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'EX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[1])
end
redis.call('SADD', KEYS[2], ARGV[3])
return 0
"#;

/// Filter for [`JobStore::list`]. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Whether a fetched record passes the status, type and time filters.
    pub fn matches(&self, job: &Job) -> bool {
        if self.status.is_some_and(|s| s != job.status) {
            return false;
        }
        if self
            .job_type
            .as_deref()
            .is_some_and(|t| t != job.job_type())
        {
            return false;
        }
        if self.since.is_some_and(|since| job.metadata.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| job.metadata.created_at > until) {
            return false;
        }
        true
    }

    /// Sort by creation time and apply offset/limit.
    pub fn paginate(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| {
            a.metadata
                .created_at
                .cmp(&b.metadata.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let page = jobs.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => page.take(limit).collect(),
            None => page.collect(),
        }
    }
}

/// Durable keyed storage of job records with a per-status secondary index.
///
/// Writes for the same id are last-write-wins; callers that need strict
/// per-job ordering must serialize externally.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job, stamping `created_at`/`updated_at` and indexing it
    /// under its status.
    async fn create(&self, job: &mut Job) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Job, StoreError>;

    /// Persist a modified job and move its index entry.
    ///
    /// If the previous record is gone, index removal is skipped and the write
    /// still happens; stale entries are cleaned up by [`JobStore::list`].
    /// A stored record that is already `completed` or `failed` is never
    /// overwritten: the write fails with [`StoreError::Finished`].
    async fn update(&self, job: &mut Job) -> Result<(), StoreError>;

    /// List jobs matching `filter`.
    ///
    /// Without a status filter this scans the whole namespace, which is
    /// expensive on large stores.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Check backend connectivity (for health checks).
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release backend connections. Idempotent.
    async fn close(&self) -> Result<(), StoreError>;

    /// Load, apply a status transition and write back.
    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        result: Option<JobResult>,
        error: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut job = self.get(id).await?;
        job.transition(status, result, error)?;
        self.update(&mut job).await?;
        Ok(job)
    }
}

/// Redis-backed job store.
///
/// Records live at `<prefix>:<id>` as JSON strings with an optional expiry;
/// the index for each status is the set `<prefix>:status:<status>`.
pub struct RedisJobStore {
    conn: MultiplexedConnection,
    prefix: String,
    ttl_secs: u64,
    create_script: Script,
    update_script: Script,
    closed: AtomicBool,
}

impl RedisJobStore {
    /// Connect and verify the connection with a PING.
    pub async fn connect(
        redis_url: &str,
        prefix: impl Into<String>,
        ttl_secs: u64,
    ) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            ttl_secs,
            create_script: Script::new(CREATE_SCRIPT),
            update_script: Script::new(UPDATE_SCRIPT),
            closed: AtomicBool::new(false),
        })
    }

    fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    fn index_key(&self, status: JobStatus) -> String {
        format!("{}:status:{}", self.prefix, status)
    }

    fn index_prefix(&self) -> String {
        format!("{}:status:", self.prefix)
    }

    fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.conn.clone())
    }

    async fn fetch_raw(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Option<String>, StoreError> {
        let raw: Option<String> = conn.get(self.key(id)).await?;
        Ok(raw)
    }

    /// Fetch records for the given keys in batches. Missing keys yield `None`.
    async fn fetch_many(
        &self,
        conn: &mut MultiplexedConnection,
        keys: &[String],
    ) -> Result<Vec<Option<String>>, StoreError> {
        let mut out = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(FETCH_BATCH) {
            let values: Vec<Option<String>> =
                redis::cmd("MGET").arg(chunk).query_async(conn).await?;
            out.extend(values);
        }
        Ok(out)
    }

    async fn scan_namespace(
        &self,
        conn: &mut MultiplexedConnection,
    ) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}:*", self.prefix);
        let index_prefix = self.index_prefix();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(conn)
                .await?;
            keys.extend(batch.into_iter().filter(|k| !k.starts_with(&index_prefix)));
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut conn = self.connection()?;

        let now = Utc::now();
        job.metadata.created_at = now;
        job.metadata.updated_at = now;
        let payload = serde_json::to_string(job)?;

        let created: i32 = self
            .create_script
            .key(self.key(&job.id))
            .key(self.index_key(job.status))
            .arg(payload)
            .arg(self.ttl_secs)
            .arg(&job.id)
            .invoke_async(&mut conn)
            .await?;

        if created == 0 {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Job, StoreError> {
        let mut conn = self.connection()?;
        let raw = self
            .fetch_raw(&mut conn, id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut conn = self.connection()?;

        job.metadata.updated_at = Utc::now();
        let payload = serde_json::to_string(job)?;

        let refused: i32 = self
            .update_script
            .key(self.key(&job.id))
            .key(self.index_key(job.status))
            .arg(payload)
            .arg(self.ttl_secs)
            .arg(&job.id)
            .arg(job.status.to_string())
            .arg(self.index_prefix())
            .invoke_async(&mut conn)
            .await?;

        if refused == 1 {
            return Err(StoreError::Finished(job.id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.connection()?;

        let (ids, keys): (Vec<Option<String>>, Vec<String>) = match filter.status {
            Some(status) => {
                let members: Vec<String> = conn.smembers(self.index_key(status)).await?;
                members
                    .into_iter()
                    .map(|id| {
                        let key = self.key(&id);
                        (Some(id), key)
                    })
                    .unzip()
            }
            None => {
                warn!(prefix = %self.prefix, "Listing jobs without a status filter scans the whole namespace");
                let keys = self.scan_namespace(&mut conn).await?;
                (vec![None; keys.len()], keys)
            }
        };

        let raws = self.fetch_many(&mut conn, &keys).await?;

        let mut jobs = Vec::new();
        let mut stale = Vec::new();
        for (id, raw) in ids.into_iter().zip(raws) {
            let Some(raw) = raw else {
                // Expired or deleted between index read and fetch.
                if let Some(id) = id {
                    stale.push(id);
                }
                continue;
            };
            let job: Job = match serde_json::from_str(&raw) {
                Ok(job) => job,
                Err(e) => {
                    debug!(error = %e, "Skipping undecodable job record");
                    continue;
                }
            };
            if let Some(status) = filter.status {
                if job.status != status {
                    stale.push(job.id);
                    continue;
                }
            }
            if filter.matches(&job) {
                jobs.push(job);
            }
        }

        if let Some(status) = filter.status {
            if !stale.is_empty() {
                debug!(status = %status, count = stale.len(), "Removing stale index entries");
                let _: () = conn.srem(self.index_key(status), &stale).await?;
            }
        }

        Ok(filter.paginate(jobs))
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let job = self.get(id).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .srem(self.index_key(job.status), id)
            .ignore()
            .del(self.key(id))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(prefix = %self.prefix, "Job store closed");
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job already exists: {0}")]
    AlreadyExists(String),

    #[error("Job has already finished: {0}")]
    Finished(String),

    #[error("Job store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("Job store is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobInput, JobParams, ResizeParams};
    use chrono::Duration;

    fn job_at(offset_secs: i64, params: JobParams) -> Job {
        let mut job = Job::new(
            params,
            JobInput {
                storage_key: "k".to_string(),
                mime_type: "image/png".to_string(),
                size: 1,
            },
            "req",
        );
        job.metadata.created_at = Utc::now() + Duration::seconds(offset_secs);
        job
    }

    fn resize() -> JobParams {
        JobParams::Resize(ResizeParams {
            width: 10,
            height: 10,
        })
    }

    #[test]
    fn test_filter_matches_time_bounds_inclusively() {
        let job = job_at(0, resize());
        let at = job.metadata.created_at;
        let filter = JobFilter {
            since: Some(at),
            until: Some(at),
            ..Default::default()
        };
        assert!(filter.matches(&job));

        let filter = JobFilter {
            since: Some(at + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!filter.matches(&job));
    }

    #[test]
    fn test_filter_matches_type() {
        let job = job_at(0, resize());
        let filter = JobFilter {
            job_type: Some("crop".to_string()),
            ..Default::default()
        };
        assert!(!filter.matches(&job));
        let filter = JobFilter {
            job_type: Some("resize".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&job));
    }

    #[test]
    fn test_paginate_orders_by_creation() {
        let jobs = vec![job_at(30, resize()), job_at(10, resize()), job_at(20, resize())];
        let expected: Vec<String> = {
            let mut sorted = jobs.clone();
            sorted.sort_by_key(|j| j.metadata.created_at);
            sorted.into_iter().map(|j| j.id).collect()
        };

        let filter = JobFilter {
            limit: Some(2),
            offset: 1,
            ..Default::default()
        };
        let page: Vec<String> = filter.paginate(jobs).into_iter().map(|j| j.id).collect();
        assert_eq!(page, expected[1..3].to_vec());
    }
}
