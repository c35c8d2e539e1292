//! Redis Streams queue backend.
//!
//! - **Stream**: `<stream>:<subject>`, one entry per delivery attempt with the
//!   fields `subject`, `job_id`, `attempt` and `payload`
//! - **Consumer group**: the configured durable consumer name; every process
//!   joins it under a unique member name
//! - **Settlement**: every outcome acknowledges and deletes the entry, so
//!   the stream only holds unsettled messages
//! - **Redelivery**: a retry settles the current entry and appends a new one
//!   with `attempt + 1` in a single transaction
//! - **Recovery**: entries left unacknowledged for longer than `ack_wait`
//!   (crashed or cancelled members) are found with XPENDING and claimed with
//!   XCLAIM; each earlier delivery counts as an attempt
//! - **Dead letters**: `<stream>:<subject>:dlq`, capped at roughly
//!   [`DEAD_LETTER_MAX_LEN`] entries

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::models::job::Job;
use crate::services::queue::{
    attempts_exhausted, decode_delivery, disposition, Disposition, JobConsumer, JobHandler,
    JobPublisher, QueueConfig, QueueError, ATTEMPTS_EXHAUSTED,
};

/// How long a single XREADGROUP call blocks waiting for new entries.
const READ_BLOCK_MS: usize = 1_000;

/// Pause after a failed read before trying again.
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Approximate cap on the dead-letter stream (`XADD MAXLEN ~`).
pub const DEAD_LETTER_MAX_LEN: usize = 10_000;

/// A stream entry handed to this consumer.
#[derive(Debug)]
struct Delivery {
    message_id: String,
    attempt: u32,
    payload: Option<Vec<u8>>,
}

impl Delivery {
    /// `earlier_deliveries` is the number of times the entry was delivered
    /// before this delivery (zero for a fresh read).
    fn from_entry(entry: &StreamId, earlier_deliveries: u64) -> Self {
        let base: u32 = entry.get("attempt").unwrap_or(1);
        let earlier = u32::try_from(earlier_deliveries).unwrap_or(u32::MAX);
        Self {
            message_id: entry.id.clone(),
            attempt: base.saturating_add(earlier),
            payload: entry.get("payload"),
        }
    }
}

/// Connection and key names needed to settle a delivery from a handler task.
#[derive(Clone)]
struct Settler {
    conn: MultiplexedConnection,
    stream_key: String,
    dead_letter_key: String,
    group: String,
    subject: String,
    max_retry: u32,
}

impl Settler {
    async fn deliver(&self, delivery: Delivery, handler: Arc<dyn JobHandler>) {
        let Delivery {
            message_id,
            attempt,
            payload,
        } = delivery;

        let Some(payload) = payload else {
            warn!(message_id = %message_id, "Dropping stream entry without payload");
            self.settle_or_log(&message_id, self.ack(&message_id).await);
            return;
        };

        let job = match decode_delivery(&payload, attempt) {
            Ok(job) => job,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Dropping malformed job message");
                self.settle_or_log(&message_id, self.ack(&message_id).await);
                return;
            }
        };
        let job_id = job.id.clone();

        // Deliveries lost to crashed consumers count against the budget.
        if attempts_exhausted(attempt, self.max_retry) {
            warn!(job_id = %job_id, attempt, "Delivery attempts exhausted");
            handler.exhausted(job, ATTEMPTS_EXHAUSTED).await;
            let result = self
                .dead_letter(&message_id, &job_id, attempt, ATTEMPTS_EXHAUSTED, &payload)
                .await;
            self.settle_or_log(&message_id, result);
            return;
        }

        let outcome = handler.handle(job).await;
        let result = match (disposition(&outcome, attempt, self.max_retry), outcome) {
            (Disposition::Ack, _) => {
                debug!(job_id = %job_id, attempt, "Job acknowledged");
                self.ack(&message_id).await
            }
            (Disposition::Retry, Err(e)) => {
                info!(job_id = %job_id, attempt, error = %e, "Job failed, scheduling redelivery");
                self.retry(&message_id, &job_id, attempt + 1, &payload).await
            }
            (_, outcome) => {
                let reason = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                warn!(job_id = %job_id, attempt, error = %reason, "Job dead-lettered");
                self.dead_letter(&message_id, &job_id, attempt, &reason, &payload)
                    .await
            }
        };
        self.settle_or_log(&message_id, result);
    }

    /// A failed settlement leaves the entry pending; it is reclaimed after
    /// `ack_wait`.
    fn settle_or_log(&self, message_id: &str, result: Result<(), redis::RedisError>) {
        if let Err(e) = result {
            error!(message_id = %message_id, error = %e, "Failed to settle stream entry");
        }
    }

    async fn ack(&self, message_id: &str) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .xack(&self.stream_key, &self.group, &[message_id])
            .ignore()
            .xdel(&self.stream_key, &[message_id])
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn retry(
        &self,
        message_id: &str,
        job_id: &str,
        next_attempt: u32,
        payload: &[u8],
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .xack(&self.stream_key, &self.group, &[message_id])
            .ignore()
            .xdel(&self.stream_key, &[message_id])
            .ignore()
            .cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("subject")
            .arg(&self.subject)
            .arg("job_id")
            .arg(job_id)
            .arg("attempt")
            .arg(next_attempt)
            .arg("payload")
            .arg(payload)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn dead_letter(
        &self,
        message_id: &str,
        job_id: &str,
        attempt: u32,
        reason: &str,
        payload: &[u8],
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .xack(&self.stream_key, &self.group, &[message_id])
            .ignore()
            .xdel(&self.stream_key, &[message_id])
            .ignore()
            .cmd("XADD")
            .arg(&self.dead_letter_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(DEAD_LETTER_MAX_LEN)
            .arg("*")
            .arg("original_id")
            .arg(message_id)
            .arg("job_id")
            .arg(job_id)
            .arg("attempt")
            .arg(attempt)
            .arg("error")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(payload)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        metrics::counter!("image_jobs_dead_lettered_total").increment(1);
        Ok(())
    }
}

/// Queue backed by a Redis stream and consumer group.
pub struct RedisStreamQueue {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: QueueConfig,
    stream_key: String,
    dead_letter_key: String,
    closed: AtomicBool,
    subscribed: AtomicBool,
}

impl RedisStreamQueue {
    /// Connect, verify the connection and create the consumer group (and the
    /// stream) if they do not exist yet.
    pub async fn connect(config: QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let stream_key = config.stream_key();
        let created: redis::RedisResult<()> = conn
            .xgroup_create_mkstream(&stream_key, &config.consumer, "0")
            .await;
        match created {
            Ok(()) => info!(stream = %stream_key, group = %config.consumer, "Created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            client,
            conn,
            dead_letter_key: config.dead_letter_key(),
            stream_key,
            config,
            closed: AtomicBool::new(false),
            subscribed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(self.conn.clone())
    }

    fn settler(&self) -> Settler {
        Settler {
            conn: self.conn.clone(),
            stream_key: self.stream_key.clone(),
            dead_letter_key: self.dead_letter_key.clone(),
            group: self.config.consumer.clone(),
            subject: self.config.subject.clone(),
            max_retry: self.config.max_retry,
        }
    }

    fn ack_wait_ms(&self) -> usize {
        usize::try_from(self.config.ack_wait.as_millis()).unwrap_or(usize::MAX)
    }

    /// Read up to `count` entries never delivered to the group.
    async fn read_new(
        &self,
        reader: &mut MultiplexedConnection,
        member: &str,
        count: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let options = StreamReadOptions::default()
            .group(&self.config.consumer, member)
            .count(count)
            .block(READ_BLOCK_MS);
        let reply: StreamReadReply = reader
            .xread_options(&[&self.stream_key], &[">"], &options)
            .await?;

        Ok(reply
            .keys
            .iter()
            .flat_map(|key| key.ids.iter())
            .map(|entry| Delivery::from_entry(entry, 0))
            .collect())
    }

    /// Claim up to `count` entries that have been pending for longer than
    /// `ack_wait`.
    #[instrument(skip(self), fields(stream = %self.stream_key), err)]
    async fn reclaim(&self, member: &str, count: usize) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self.connection()?;
        let min_idle = self.ack_wait_ms();

        // (id, owner, idle ms, delivery count)
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.config.consumer)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let delivered: HashMap<String, u64> = pending
            .into_iter()
            .map(|(id, _, _, count)| (id, count))
            .collect();
        let ids: Vec<&str> = delivered.keys().map(String::as_str).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(&self.stream_key, &self.config.consumer, member, min_idle, &ids[..])
            .await?;

        let deliveries: Vec<Delivery> = claimed
            .ids
            .iter()
            .map(|entry| {
                let earlier = delivered.get(&entry.id).copied().unwrap_or(1);
                Delivery::from_entry(entry, earlier)
            })
            .collect();
        if !deliveries.is_empty() {
            info!(count = deliveries.len(), "Reclaimed unacknowledged stream entries");
        }
        Ok(deliveries)
    }

    /// Feed deliveries to the dispatcher until `cancel` fires or the
    /// dispatcher goes away.
    ///
    /// Permits are taken before each read and travel with the deliveries, so
    /// a read is only issued when there is room to handle what it returns.
    /// Reads and claims run to completion; a reply is never discarded.
    async fn fetch(
        &self,
        reader: &mut MultiplexedConnection,
        member: &str,
        permits: Arc<Semaphore>,
        deliveries: mpsc::Sender<(OwnedSemaphorePermit, Delivery)>,
        cancel: CancellationToken,
    ) {
        let reclaim_every = self.config.ack_wait.max(Duration::from_secs(1));
        let mut next_reclaim = Instant::now();

        loop {
            let first = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let mut batch = vec![first];
            while let Ok(permit) = permits.clone().try_acquire_owned() {
                batch.push(permit);
            }

            let fetched = if Instant::now() >= next_reclaim {
                next_reclaim = Instant::now() + reclaim_every;
                self.reclaim(member, batch.len()).await
            } else {
                self.read_new(reader, member, batch.len()).await
            };

            match fetched {
                Ok(found) => {
                    // Permits beyond the number of entries found drop here.
                    for (delivery, permit) in found.into_iter().zip(batch) {
                        if deliveries.send((permit, delivery)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    drop(batch);
                    warn!(error = %e, "Failed to read job stream");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
    }

    async fn consume(
        &self,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        // Blocking reads get their own connection so they never stall
        // publishes and acknowledgements.
        let mut reader = self.client.get_multiplexed_async_connection().await?;
        let member = format!("{}-{}", self.config.consumer, uuid::Uuid::new_v4().simple());
        let max_in_flight = self.config.max_in_flight.max(1);
        let permits = Arc::new(Semaphore::new(max_in_flight));
        let (sender, mut receiver) = mpsc::channel(max_in_flight);

        info!(
            stream = %self.stream_key,
            group = %self.config.consumer,
            member = %member,
            max_in_flight,
            "Subscribed to job stream"
        );

        let settler = self.settler();
        let dispatch_cancel = cancel.clone();
        let dispatch = async move {
            let mut tasks = JoinSet::new();
            loop {
                tokio::select! {
                    biased;
                    _ = dispatch_cancel.cancelled() => break,
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(e) = joined {
                            error!(error = %e, "Job handler task failed");
                        }
                    }
                    received = receiver.recv() => {
                        let Some((permit, delivery)) = received else { break };
                        let settler = settler.clone();
                        let handler = handler.clone();
                        tasks.spawn(async move {
                            let _permit = permit;
                            settler.deliver(delivery, handler).await;
                        });
                    }
                }
            }
            drop(receiver);

            // Unsettled entries stay pending and are reclaimed after `ack_wait`.
            let abandoned = tasks.len();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            abandoned
        };

        let ((), abandoned) = tokio::join!(
            self.fetch(&mut reader, &member, permits, sender, cancel),
            dispatch
        );
        info!(member = %member, abandoned, "Job stream subscription stopped");
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for RedisStreamQueue {
    #[instrument(skip(self, job), fields(job_id = %job.id, stream = %self.stream_key), err)]
    async fn publish(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let payload =
            serde_json::to_vec(job).map_err(|e| QueueError::PublishFailed(e.to_string()))?;

        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg("subject")
            .arg(&self.config.subject)
            .arg("job_id")
            .arg(&job.id)
            .arg("attempt")
            .arg(1)
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::PublishFailed(format!("XADD failed: {}", e)))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(stream = %self.stream_key, "Job queue closed");
        }
        Ok(())
    }
}

#[async_trait]
impl JobConsumer for RedisStreamQueue {
    async fn subscribe(
        &self,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadySubscribed);
        }
        let result = self.consume(handler, cancel).await;
        self.subscribed.store(false, Ordering::Release);
        result
    }

    async fn close(&self) -> Result<(), QueueError> {
        JobPublisher::close(self).await
    }
}
