//! At-least-once job delivery.
//!
//! A publisher appends serialized jobs to a durable stream; a consumer
//! delivers them to a [`JobHandler`] and settles each message according to
//! the handler's outcome and the message's delivery attempt.
//!
//! The broker's delivery attempt is the only retry counter. It is carried in
//! message metadata, never in the job body, and is copied into
//! `metadata.retry_count` (as `attempt - 1`) before the handler runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::models::job::Job;

/// Broker and consumer settings shared by every queue backend.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub url: String,
    pub stream: String,
    pub subject: String,
    /// Durable consumer (group) name.
    pub consumer: String,
    /// Redeliveries allowed after the first attempt.
    pub max_retry: u32,
    /// Upper bound on messages being handled at once.
    pub max_in_flight: usize,
    /// How long an unacknowledged message stays with a consumer before it is
    /// reclaimed for redelivery.
    pub ack_wait: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            stream: "IMAGE_JOBS".to_string(),
            subject: "jobs.image".to_string(),
            consumer: "image-workers".to_string(),
            max_retry: 3,
            max_in_flight: 100,
            ack_wait: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            url: config.redis_url.clone(),
            stream: config.queue_stream.clone(),
            subject: config.queue_subject.clone(),
            consumer: config.queue_consumer.clone(),
            max_retry: config.queue_max_retry,
            max_in_flight: config.queue_max_in_flight.max(1),
            ack_wait: Duration::from_secs(config.queue_ack_wait_secs),
        }
    }

    /// Stream key holding messages for the configured subject.
    pub fn stream_key(&self) -> String {
        format!("{}:{}", self.stream, self.subject)
    }

    pub fn dead_letter_key(&self) -> String {
        format!("{}:dlq", self.stream_key())
    }
}

/// Error returned by a [`JobHandler`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Transient failure; the message is redelivered while budget remains.
    #[error("{0}")]
    Retryable(String),

    /// The job can never succeed; the message is dead-lettered at once.
    #[error("{0}")]
    Permanent(String),
}

/// Reason recorded when a message is dead-lettered without being handled.
pub const ATTEMPTS_EXHAUSTED: &str = "delivery attempts exhausted";

/// Processes one delivered job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<(), HandlerError>;

    /// Called instead of [`JobHandler::handle`] when a message arrives with
    /// its delivery budget already spent (earlier deliveries were lost to a
    /// crashed consumer or a panicking handler). The message is dead-lettered
    /// once this returns.
    async fn exhausted(&self, _job: Job, _reason: &str) {}
}

#[async_trait]
pub trait JobPublisher: Send + Sync {
    /// Append a job to the stream. Success means the broker accepted it, not
    /// that any consumer has seen it.
    async fn publish(&self, job: &Job) -> Result<(), QueueError>;

    /// Check broker connectivity (for health checks).
    async fn health_check(&self) -> Result<(), QueueError>;

    /// Release broker connections. Idempotent.
    async fn close(&self) -> Result<(), QueueError>;
}

#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Deliver messages to `handler` until `cancel` fires.
    ///
    /// Messages still being handled when `cancel` fires are left
    /// unacknowledged and will be redelivered.
    async fn subscribe(
        &self,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;
}

/// How a delivered message is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative acknowledgement: redeliver with the next attempt number.
    Retry,
    DeadLetter,
}

/// Decide how to settle a message after delivery attempt `attempt`
/// (starting at 1). A handler that always fails retryably is invoked exactly
/// `max_retry + 1` times.
pub fn disposition(outcome: &Result<(), HandlerError>, attempt: u32, max_retry: u32) -> Disposition {
    match outcome {
        Ok(()) => Disposition::Ack,
        Err(HandlerError::Retryable(_)) if attempt <= max_retry => Disposition::Retry,
        Err(_) => Disposition::DeadLetter,
    }
}

/// Whether delivery `attempt` is past the `max_retry + 1` attempts a message
/// may be handled.
pub fn attempts_exhausted(attempt: u32, max_retry: u32) -> bool {
    attempt > max_retry.saturating_add(1)
}

/// Decode a message payload and stamp the delivery attempt onto the job.
pub(crate) fn decode_delivery(payload: &[u8], attempt: u32) -> Result<Job, serde_json::Error> {
    let mut job: Job = serde_json::from_slice(payload)?;
    job.metadata.retry_count = attempt.saturating_sub(1);
    Ok(job)
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Failed to publish job: {0}")]
    PublishFailed(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Queue is closed")]
    Closed,

    #[error("Subscription already active on this consumer")]
    AlreadySubscribed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{JobInput, JobParams, ResizeParams};

    #[test]
    fn test_success_is_acknowledged() {
        assert_eq!(disposition(&Ok(()), 1, 3), Disposition::Ack);
        assert_eq!(disposition(&Ok(()), 4, 3), Disposition::Ack);
    }

    #[test]
    fn test_retryable_failure_retries_within_budget() {
        let err = Err(HandlerError::Retryable("timeout".to_string()));
        assert_eq!(disposition(&err, 1, 3), Disposition::Retry);
        assert_eq!(disposition(&err, 3, 3), Disposition::Retry);
        assert_eq!(disposition(&err, 4, 3), Disposition::DeadLetter);
    }

    #[test]
    fn test_zero_retry_budget_dead_letters_first_failure() {
        let err = Err(HandlerError::Retryable("timeout".to_string()));
        assert_eq!(disposition(&err, 1, 0), Disposition::DeadLetter);
    }

    #[test]
    fn test_permanent_failure_is_dead_lettered() {
        let err = Err(HandlerError::Permanent("bad params".to_string()));
        assert_eq!(disposition(&err, 1, 3), Disposition::DeadLetter);
    }

    #[test]
    fn test_attempts_exhausted_after_budget() {
        assert!(!attempts_exhausted(1, 0));
        assert!(attempts_exhausted(2, 0));
        assert!(!attempts_exhausted(4, 3));
        assert!(attempts_exhausted(5, 3));
        assert!(!attempts_exhausted(u32::MAX, u32::MAX));
    }

    #[test]
    fn test_decode_delivery_projects_attempt() {
        let job = Job::new(
            JobParams::Resize(ResizeParams {
                width: 1,
                height: 1,
            }),
            JobInput {
                storage_key: "k".to_string(),
                mime_type: "image/png".to_string(),
                size: 1,
            },
            "req",
        );
        let payload = serde_json::to_vec(&job).unwrap();
        let decoded = decode_delivery(&payload, 3).unwrap();
        assert_eq!(decoded.id, job.id);
        assert_eq!(decoded.metadata.retry_count, 2);

        assert!(decode_delivery(b"{not json", 1).is_err());
    }

    #[test]
    fn test_stream_keys() {
        let config = QueueConfig::default();
        assert_eq!(config.stream_key(), "IMAGE_JOBS:jobs.image");
        assert_eq!(config.dead_letter_key(), "IMAGE_JOBS:jobs.image:dlq");
    }
}
