//! Delivery job queue.
//!
//! Jobs carry only a notification id. Delivery is at-least-once: a job stays
//! owned by the consumer until it is acknowledged or rejected, and is handed
//! out again if the consumer disappears first.

mod memory;
mod streams;

pub use memory::{MemoryJobQueue, QueueEvent};
pub use streams::{QueueConfig, RedisJobQueue};

use async_trait::async_trait;
use thiserror::Error;

/// Field holding the notification id in every job message.
pub const NOTIFICATION_ID_FIELD: &str = "notification_id";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Channel is closed")]
    Closed,
}

impl QueueError {
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::Redis(e) => {
                e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
            }
            QueueError::Closed => false,
        }
    }
}

/// Broker handle for one delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    /// Broker-assigned id of the delivered message.
    pub entry_id: String,
    /// Raw message payload, republished when the message is requeued.
    pub payload: String,
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.entry_id)
    }
}

/// One delivered job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub notification_id: i64,
    pub tag: DeliveryTag,
}

impl Job {
    /// Build a job from a raw payload. `None` when the payload is not a notification id.
    pub fn parse(entry_id: impl Into<String>, payload: impl Into<String>) -> Option<Self> {
        let payload = payload.into();
        let notification_id = payload.trim().parse().ok()?;
        Some(Self {
            notification_id,
            tag: DeliveryTag {
                entry_id: entry_id.into(),
                payload,
            },
        })
    }
}

/// Acknowledgment side of the broker channel.
#[async_trait]
pub trait AckChannel: Send + Sync {
    /// Whether ack/reject can still reach the broker.
    fn is_open(&self) -> bool;

    /// Settle the message as processed.
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError>;

    /// Settle the message as not processed. With `requeue` it is delivered
    /// again; without, it is moved to the dead-letter destination.
    async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), QueueError>;
}

/// Producer side, used by the intake path.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, notification_id: i64) -> Result<(), QueueError>;
}

/// Consumer side, driven by the worker loop.
#[async_trait]
pub trait JobSource: AckChannel {
    /// Jobs delivered to this consumer earlier and never settled.
    async fn recover(&self) -> Result<Vec<Job>, QueueError>;

    /// Up to `max` new jobs, waiting a bounded time when none are ready.
    async fn next_batch(&self, max: usize) -> Result<Vec<Job>, QueueError>;

    /// Take over up to `max` jobs left unsettled by other consumers for too long.
    async fn claim_abandoned(&self, max: usize) -> Result<Vec<Job>, QueueError>;

    /// Stop settling messages. Later ack/reject calls fail with `Closed`.
    fn close(&self);
}
