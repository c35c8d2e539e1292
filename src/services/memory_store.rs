use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::models::job::{Job, JobStatus};
use crate::services::job_store::{JobFilter, JobStore, StoreError};

struct Record {
    payload: String,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Default)]
struct State {
    records: HashMap<String, Record>,
    index: HashMap<JobStatus, BTreeSet<String>>,
}

impl State {
    fn live_payload(&self, id: &str) -> Option<&str> {
        self.records
            .get(id)
            .filter(|r| r.is_live(Instant::now()))
            .map(|r| r.payload.as_str())
    }
}

/// In-process job store with the same semantics as the Redis store:
/// serialized records, optional expiry and a per-status index that is only
/// repaired by listing.
///
/// Every mutation holds a single write lock, so record and index changes are
/// observed together.
#[derive(Default)]
pub struct MemoryJobStore {
    state: RwLock<State>,
    ttl: Option<Duration>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records expire `ttl` after their last write.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: RwLock::default(),
            ttl: Some(ttl),
        }
    }

    /// Ids currently indexed under `status`, including stale entries.
    pub async fn index_members(&self, status: JobStatus) -> Vec<String> {
        let state = self.state.read().await;
        state
            .index
            .get(&status)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a record without touching the index, as a backend expiry would.
    pub async fn evict(&self, id: &str) -> bool {
        self.state.write().await.records.remove(id).is_some()
    }

    fn expiry(&self) -> Option<Instant> {
        self.ttl.map(|ttl| Instant::now() + ttl)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.live_payload(&job.id).is_some() {
            return Err(StoreError::AlreadyExists(job.id.clone()));
        }

        let now = Utc::now();
        job.metadata.created_at = now;
        job.metadata.updated_at = now;
        let payload = serde_json::to_string(job)?;

        state.records.insert(
            job.id.clone(),
            Record {
                payload,
                expires_at: self.expiry(),
            },
        );
        state
            .index
            .entry(job.status)
            .or_default()
            .insert(job.id.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Job, StoreError> {
        let state = self.state.read().await;
        let raw = state
            .live_payload(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(raw)?)
    }

    async fn update(&self, job: &mut Job) -> Result<(), StoreError> {
        let mut state = self.state.write().await;

        let previous = state
            .live_payload(&job.id)
            .and_then(|raw| serde_json::from_str::<Job>(raw).ok())
            .map(|j| j.status);
        match previous {
            Some(old) if old.is_terminal() => return Err(StoreError::Finished(job.id.clone())),
            Some(old) if old != job.status => {
                if let Some(ids) = state.index.get_mut(&old) {
                    ids.remove(&job.id);
                }
            }
            Some(_) => {}
            None => debug!(job_id = %job.id, "Previous job record missing, skipping index removal"),
        }

        job.metadata.updated_at = Utc::now();
        let payload = serde_json::to_string(job)?;
        state.records.insert(
            job.id.clone(),
            Record {
                payload,
                expires_at: self.expiry(),
            },
        );
        state
            .index
            .entry(job.status)
            .or_default()
            .insert(job.id.clone());
        Ok(())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut state = self.state.write().await;

        let candidates: Vec<String> = match filter.status {
            Some(status) => state
                .index
                .get(&status)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
            None => state.records.keys().cloned().collect(),
        };

        let mut jobs = Vec::new();
        let mut stale = Vec::new();
        for id in candidates {
            let Some(raw) = state.live_payload(&id) else {
                stale.push(id);
                continue;
            };
            let Ok(job) = serde_json::from_str::<Job>(raw) else {
                continue;
            };
            if filter.status.is_some_and(|s| s != job.status) {
                stale.push(id);
                continue;
            }
            if filter.matches(&job) {
                jobs.push(job);
            }
        }

        if let Some(status) = filter.status {
            if let Some(ids) = state.index.get_mut(&status) {
                for id in &stale {
                    ids.remove(id);
                }
            }
        }
        // Expired records are purged on any listing.
        let now = Instant::now();
        state.records.retain(|_, r| r.is_live(now));

        Ok(filter.paginate(jobs))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let raw = state
            .live_payload(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let status = serde_json::from_str::<Job>(raw)?.status;

        state.records.remove(id);
        if let Some(ids) = state.index.get_mut(&status) {
            ids.remove(id);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
