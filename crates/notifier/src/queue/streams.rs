//! Redis Streams job queue.
//!
//! Every worker joins one consumer group. `XREADGROUP` hands a job to exactly
//! one consumer and records it in that consumer's pending list until it is
//! settled:
//!
//! - ack: `XACK` + `XDEL`
//! - reject with requeue: `XADD` a copy to the job stream, then `XACK` + `XDEL`
//! - reject without requeue: `XADD` to the dead-letter stream, then `XACK` + `XDEL`
//!
//! Each settlement runs as one `MULTI`/`EXEC` pipeline so a message is never
//! both requeued and still pending.
//!
//! A blocking `XREADGROUP` holds its connection until it returns, and Redis
//! answers one connection's commands in order. The blocking read therefore
//! runs on a dedicated reader connection so acks and requeues issued by
//! in-flight jobs are never queued behind it.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamReadOptions,
    StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};

use herald_common::config::AppConfig;

use super::{AckChannel, DeliveryTag, Job, JobPublisher, JobSource, NOTIFICATION_ID_FIELD, QueueError};

/// Stream names and consumer identity for one queue handle.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub dead_letter_stream: String,
    /// How long `next_batch` blocks waiting for new jobs.
    pub block_ms: u64,
    /// Minimum idle time before another consumer's job may be claimed.
    pub claim_idle_ms: u64,
}

impl QueueConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            stream: config.job_stream.clone(),
            group: config.job_consumer_group.clone(),
            consumer: config.worker_consumer_name.clone(),
            dead_letter_stream: config.job_dead_letter_stream.clone(),
            block_ms: config.worker_block_ms,
            claim_idle_ms: config.worker_claim_idle_ms,
        }
    }
}

pub struct RedisJobQueue {
    /// Shared connection for publishing, settling and non-blocking reads.
    redis: ConnectionManager,
    /// Connection reserved for the blocking `XREADGROUP` in `next_batch`.
    reader: Option<ConnectionManager>,
    config: QueueConfig,
    open: AtomicBool,
}

impl RedisJobQueue {
    /// Queue handle without a reader connection. Enough for publishing; a
    /// consumer built this way polls instead of blocking in Redis.
    pub fn new(redis: ConnectionManager, config: QueueConfig) -> Self {
        Self {
            redis,
            reader: None,
            config,
            open: AtomicBool::new(true),
        }
    }

    /// Use `reader` for blocking reads. It must be a separate connection
    /// from the one passed to [`new`](Self::new).
    pub fn with_reader(mut self, reader: ConnectionManager) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Create the consumer group (and stream) if missing.
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let result: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    stream = %self.config.stream,
                    group = %self.config.group,
                    "Created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(group = %self.config.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    /// Turn raw stream entries into jobs. Entries without a usable
    /// notification id can never be processed and go straight to the
    /// dead-letter stream.
    async fn into_jobs(&self, entries: Vec<StreamId>) -> Result<Vec<Job>, QueueError> {
        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            let payload: Option<String> = entry.get(NOTIFICATION_ID_FIELD);
            match payload.as_deref().and_then(|p| Job::parse(entry.id.clone(), p)) {
                Some(job) => jobs.push(job),
                None => {
                    tracing::error!(
                        entry_id = %entry.id,
                        payload = ?payload,
                        "Malformed job message, dead-lettering"
                    );
                    let tag = DeliveryTag {
                        entry_id: entry.id.clone(),
                        payload: payload.unwrap_or_default(),
                    };
                    self.dead_letter(&tag).await?;
                }
            }
        }
        Ok(jobs)
    }

    async fn read(
        &self,
        mut conn: ConnectionManager,
        id: &str,
        opts: StreamReadOptions,
    ) -> Result<Vec<Job>, QueueError> {
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.config.stream], &[id], &opts)
            .await?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default();
        self.into_jobs(entries).await
    }

    async fn dead_letter(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let rejected_at = Utc::now().to_rfc3339();
        let _: () = redis::pipe()
            .atomic()
            .xadd(
                &self.config.dead_letter_stream,
                "*",
                &[
                    (NOTIFICATION_ID_FIELD, tag.payload.as_str()),
                    ("source_id", tag.entry_id.as_str()),
                    ("consumer", self.config.consumer.as_str()),
                    ("rejected_at", rejected_at.as_str()),
                ],
            )
            .ignore()
            .xack(&self.config.stream, &self.config.group, &[&tag.entry_id])
            .ignore()
            .xdel(&self.config.stream, &[&tag.entry_id])
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(QueueError::Closed)
        }
    }
}

/// Pending entries idle for at least `idle_ms` and owned by another consumer.
/// Our own pending jobs are still in flight here and must not be claimed back.
fn claimable(pending: Vec<StreamPendingId>, consumer: &str, idle_ms: u64) -> Vec<String> {
    pending
        .into_iter()
        .filter(|p| p.consumer != consumer && p.last_delivered_ms as u64 >= idle_ms)
        .map(|p| p.id)
        .collect()
}

#[async_trait]
impl AckChannel for RedisJobQueue {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .xack(&self.config.stream, &self.config.group, &[&tag.entry_id])
            .ignore()
            .xdel(&self.config.stream, &[&tag.entry_id])
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(entry_id = %tag.entry_id, "Acknowledged job");
        Ok(())
    }

    async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        self.ensure_open()?;
        if !requeue {
            self.dead_letter(tag).await?;
            tracing::debug!(entry_id = %tag.entry_id, "Rejected job to dead-letter stream");
            return Ok(());
        }

        let mut conn = self.redis.clone();
        let _: () = redis::pipe()
            .atomic()
            .xadd(
                &self.config.stream,
                "*",
                &[
                    (NOTIFICATION_ID_FIELD, tag.payload.as_str()),
                    ("requeued_from", tag.entry_id.as_str()),
                ],
            )
            .ignore()
            .xack(&self.config.stream, &self.config.group, &[&tag.entry_id])
            .ignore()
            .xdel(&self.config.stream, &[&tag.entry_id])
            .ignore()
            .query_async(&mut conn)
            .await?;

        tracing::debug!(entry_id = %tag.entry_id, "Requeued job");
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for RedisJobQueue {
    async fn publish(&self, notification_id: i64) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entry_id: String = conn
            .xadd(
                &self.config.stream,
                "*",
                &[(NOTIFICATION_ID_FIELD, notification_id.to_string())],
            )
            .await?;

        tracing::debug!(notification_id, entry_id = %entry_id, "Published delivery job");
        Ok(())
    }
}

#[async_trait]
impl JobSource for RedisJobQueue {
    async fn recover(&self) -> Result<Vec<Job>, QueueError> {
        // Id "0" replays this consumer's pending list instead of new entries.
        let opts = StreamReadOptions::default().group(&self.config.group, &self.config.consumer);
        let jobs = self.read(self.redis.clone(), "0", opts).await?;
        if !jobs.is_empty() {
            tracing::warn!(count = jobs.len(), "Recovered unsettled jobs from previous run");
        }
        Ok(jobs)
    }

    async fn next_batch(&self, max: usize) -> Result<Vec<Job>, QueueError> {
        let opts = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(max);

        if let Some(reader) = &self.reader {
            let opts = opts.block(self.config.block_ms.max(1) as usize);
            return self.read(reader.clone(), ">", opts).await;
        }

        // No reader connection: never block the shared one.
        let jobs = self.read(self.redis.clone(), ">", opts).await?;
        if jobs.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(self.config.block_ms.max(1)))
                .await;
        }
        Ok(jobs)
    }

    async fn claim_abandoned(&self, max: usize) -> Result<Vec<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.config.stream, &self.config.group, "-", "+", max)
            .await?;

        let ids = claimable(pending.ids, &self.config.consumer, self.config.claim_idle_ms);

        if ids.is_empty() {
            return Ok(vec![]);
        }

        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.claim_idle_ms,
                &ids,
            )
            .await?;

        let jobs = self.into_jobs(claimed.ids).await?;
        if !jobs.is_empty() {
            tracing::warn!(count = jobs.len(), "Claimed abandoned jobs");
        }
        Ok(jobs)
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            tracing::info!(consumer = %self.config.consumer, "Job channel closed");
        }
    }
}
