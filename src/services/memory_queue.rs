use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::job::Job;
use crate::services::queue::{
    attempts_exhausted, decode_delivery, disposition, Disposition, HandlerError, JobConsumer,
    JobHandler, JobPublisher, QueueConfig, QueueError, ATTEMPTS_EXHAUSTED,
};

#[derive(Debug, Clone)]
struct Envelope {
    id: u64,
    payload: Vec<u8>,
    attempt: u32,
}

/// A message removed from redelivery after a permanent failure or an
/// exhausted retry budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: u64,
    pub job_id: Option<String>,
    pub attempt: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

struct Inner {
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
    next_id: AtomicU64,
    ready: AtomicUsize,
    acked: AtomicU64,
    in_flight: Mutex<HashMap<u64, Envelope>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Inner {
    fn enqueue(&self, envelope: Envelope) {
        self.ready.fetch_add(1, Ordering::AcqRel);
        // The receiver lives as long as `Inner`, so sending cannot fail.
        let _ = self.sender.send(envelope);
    }

    /// Settle a delivery. Synchronous so that an aborted handler task can
    /// never leave a message half-settled.
    fn settle(&self, message_id: u64, decision: Disposition, job_id: Option<String>, error: Option<String>) {
        let Some(envelope) = lock(&self.in_flight).remove(&message_id) else {
            return;
        };

        match decision {
            Disposition::Ack => {
                self.acked.fetch_add(1, Ordering::AcqRel);
            }
            Disposition::Retry => self.enqueue(Envelope {
                attempt: envelope.attempt + 1,
                ..envelope
            }),
            Disposition::DeadLetter => {
                metrics::counter!("image_jobs_dead_lettered_total").increment(1);
                lock(&self.dead_letters).push(DeadLetter {
                    message_id,
                    job_id,
                    attempt: envelope.attempt,
                    error: error.unwrap_or_default(),
                    failed_at: Utc::now(),
                });
            }
        }
    }

    /// Put back a delivery whose handler died without settling it. The lost
    /// delivery counts as an attempt.
    fn redeliver(&self, message_id: u64) {
        let Some(envelope) = lock(&self.in_flight).remove(&message_id) else {
            return;
        };
        self.enqueue(Envelope {
            attempt: envelope.attempt + 1,
            ..envelope
        });
    }

    async fn deliver(&self, envelope: Envelope, handler: Arc<dyn JobHandler>, max_retry: u32) {
        let job = match decode_delivery(&envelope.payload, envelope.attempt) {
            Ok(job) => job,
            Err(e) => {
                warn!(message_id = envelope.id, error = %e, "Dropping malformed job message");
                self.settle(envelope.id, Disposition::Ack, None, None);
                return;
            }
        };

        let job_id = job.id.clone();
        if attempts_exhausted(envelope.attempt, max_retry) {
            warn!(job_id = %job_id, attempt = envelope.attempt, "Delivery attempts exhausted");
            handler.exhausted(job, ATTEMPTS_EXHAUSTED).await;
            self.settle(
                envelope.id,
                Disposition::DeadLetter,
                Some(job_id),
                Some(ATTEMPTS_EXHAUSTED.to_string()),
            );
            return;
        }

        let outcome = handler.handle(job).await;
        let decision = disposition(&outcome, envelope.attempt, max_retry);
        match (&decision, &outcome) {
            (Disposition::Retry, Err(e)) => {
                info!(job_id = %job_id, attempt = envelope.attempt, error = %e, "Job failed, scheduling redelivery")
            }
            (Disposition::DeadLetter, Err(e)) => {
                warn!(job_id = %job_id, attempt = envelope.attempt, error = %e, "Job dead-lettered")
            }
            _ => debug!(job_id = %job_id, attempt = envelope.attempt, "Job acknowledged"),
        }
        let error = outcome.err().map(|e: HandlerError| e.to_string());
        self.settle(envelope.id, decision, Some(job_id), error);
    }
}

/// In-process broker with the same delivery contract as the Redis stream
/// queue: explicit acknowledgement, bounded redelivery, dead-lettering and a
/// bounded number of messages in flight.
///
/// One subscription may be active at a time.
pub struct MemoryQueue {
    config: QueueConfig,
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            config,
            inner: Arc::new(Inner {
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
                next_id: AtomicU64::new(1),
                ready: AtomicUsize::new(0),
                acked: AtomicU64::new(0),
                in_flight: Mutex::new(HashMap::new()),
                dead_letters: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Append an arbitrary payload, bypassing job serialization.
    pub fn publish_raw(&self, payload: Vec<u8>) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        self.inner.enqueue(Envelope {
            id,
            payload,
            attempt: 1,
        });
        Ok(())
    }

    /// Messages waiting for delivery.
    pub fn pending_count(&self) -> usize {
        self.inner.ready.load(Ordering::Acquire)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    pub fn acked_count(&self) -> u64 {
        self.inner.acked.load(Ordering::Acquire)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.inner.dead_letters).clone()
    }
}

async fn next_delivery(
    permits: Arc<Semaphore>,
    receiver: &mut mpsc::UnboundedReceiver<Envelope>,
) -> Option<(OwnedSemaphorePermit, Envelope)> {
    let permit = permits.acquire_owned().await.ok()?;
    let envelope = receiver.recv().await?;
    Some((permit, envelope))
}

#[async_trait]
impl JobPublisher for MemoryQueue {
    async fn publish(&self, job: &Job) -> Result<(), QueueError> {
        let payload =
            serde_json::to_vec(job).map_err(|e| QueueError::PublishFailed(e.to_string()))?;
        self.publish_raw(payload)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl JobConsumer for MemoryQueue {
    async fn subscribe(
        &self,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        let mut receiver = self
            .inner
            .receiver
            .try_lock()
            .map_err(|_| QueueError::AlreadySubscribed)?;
        let permits = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut tasks = JoinSet::new();
        let mut running: HashMap<Id, u64> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                    match joined {
                        Ok((task_id, ())) => {
                            running.remove(&task_id);
                        }
                        Err(e) => {
                            let message_id = running.remove(&e.id());
                            warn!(error = %e, message_id, "Job handler task failed");
                            if let Some(message_id) = message_id {
                                self.inner.redeliver(message_id);
                            }
                        }
                    }
                }
                delivery = next_delivery(permits.clone(), &mut receiver) => {
                    let Some((permit, envelope)) = delivery else { break };
                    self.inner.ready.fetch_sub(1, Ordering::AcqRel);
                    lock(&self.inner.in_flight).insert(envelope.id, envelope.clone());

                    let message_id = envelope.id;
                    let inner = self.inner.clone();
                    let handler = handler.clone();
                    let max_retry = self.config.max_retry;
                    let task = tasks.spawn(async move {
                        let _permit = permit;
                        inner.deliver(envelope, handler, max_retry).await;
                    });
                    running.insert(task.id(), message_id);
                }
            }
        }

        // Abandon unsettled deliveries; they go back on the queue unchanged.
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        let abandoned: Vec<Envelope> = lock(&self.inner.in_flight).drain().map(|(_, e)| e).collect();
        if !abandoned.is_empty() {
            debug!(count = abandoned.len(), "Returning unacknowledged messages to the queue");
        }
        for envelope in abandoned {
            self.inner.enqueue(envelope);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        JobPublisher::close(self).await
    }
}
