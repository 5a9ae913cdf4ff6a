use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{AckChannel, DeliveryTag, Job, JobPublisher, JobSource, QueueError};

/// Settlement recorded by [`MemoryJobQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Ack { notification_id: i64 },
    Reject { notification_id: i64, requeue: bool },
}

#[derive(Default)]
struct Inner {
    next_entry: u64,
    ready: VecDeque<DeliveryTag>,
    in_flight: HashMap<String, DeliveryTag>,
    dead_letters: Vec<DeliveryTag>,
    events: Vec<QueueEvent>,
}

impl Inner {
    fn enqueue(&mut self, payload: String) -> DeliveryTag {
        self.next_entry += 1;
        let tag = DeliveryTag {
            entry_id: format!("mem-{}", self.next_entry),
            payload,
        };
        self.ready.push_back(tag.clone());
        tag
    }

    fn settle(&mut self, tag: &DeliveryTag) -> Option<DeliveryTag> {
        self.in_flight.remove(&tag.entry_id)
    }
}

/// Id for the event log. Only parsed jobs reach settlement, so the
/// fallback is never recorded for a real job.
fn notification_id(tag: &DeliveryTag) -> i64 {
    tag.payload.trim().parse().unwrap_or_default()
}

/// In-process queue with the same settle semantics as the Redis queue.
/// Records every ack/reject so tests can assert on broker decisions.
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    open: AtomicBool,
    block: Duration,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::with_block(Duration::from_millis(50))
    }

    /// Queue whose `next_batch` waits at most `block` for a job.
    pub fn with_block(block: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            open: AtomicBool::new(true),
            block,
        }
    }

    /// Enqueue a raw payload, bypassing id formatting.
    pub fn push_raw(&self, payload: impl Into<String>) -> DeliveryTag {
        let tag = self.lock().enqueue(payload.into());
        self.notify.notify_one();
        tag
    }

    /// Take the next ready job and mark it in flight, as a consumer would.
    /// Malformed payloads ahead of it are dead-lettered on the way.
    pub fn deliver_next(&self) -> Option<Job> {
        self.take_ready(1).pop()
    }

    pub fn events(&self) -> Vec<QueueEvent> {
        self.lock().events.clone()
    }

    pub fn ready_len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn dead_letters(&self) -> Vec<DeliveryTag> {
        self.lock().dead_letters.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-update; the data is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_ready(&self, max: usize) -> Vec<Job> {
        let mut jobs = Vec::new();
        while jobs.len() < max {
            let Some(tag) = self.lock().ready.pop_front() else {
                break;
            };
            match Job::parse(tag.entry_id.clone(), tag.payload.clone()) {
                Some(job) => {
                    self.lock().in_flight.insert(tag.entry_id.clone(), tag);
                    jobs.push(job);
                }
                None => {
                    tracing::error!(entry_id = %tag.entry_id, "Malformed job message, dead-lettering");
                    self.lock().dead_letters.push(tag);
                }
            }
        }
        jobs
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AckChannel for MemoryJobQueue {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        if !self.is_open() {
            return Err(QueueError::Closed);
        }
        let mut inner = self.lock();
        inner.settle(tag);
        inner.events.push(QueueEvent::Ack {
            notification_id: notification_id(tag),
        });
        Ok(())
    }

    async fn reject(&self, tag: &DeliveryTag, requeue: bool) -> Result<(), QueueError> {
        if !self.is_open() {
            return Err(QueueError::Closed);
        }
        {
            let mut inner = self.lock();
            inner.settle(tag);
            inner.events.push(QueueEvent::Reject {
                notification_id: notification_id(tag),
                requeue,
            });
            if requeue {
                inner.enqueue(tag.payload.clone());
            } else {
                inner.dead_letters.push(tag.clone());
            }
        }
        if requeue {
            self.notify.notify_one();
        }
        Ok(())
    }
}

#[async_trait]
impl JobPublisher for MemoryJobQueue {
    async fn publish(&self, notification_id: i64) -> Result<(), QueueError> {
        self.push_raw(notification_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl JobSource for MemoryJobQueue {
    async fn recover(&self) -> Result<Vec<Job>, QueueError> {
        let tags: Vec<DeliveryTag> = self.lock().in_flight.values().cloned().collect();
        Ok(tags
            .into_iter()
            .filter_map(|tag| Job::parse(tag.entry_id, tag.payload))
            .collect())
    }

    async fn next_batch(&self, max: usize) -> Result<Vec<Job>, QueueError> {
        let jobs = self.take_ready(max);
        if !jobs.is_empty() {
            return Ok(jobs);
        }
        let _ = tokio::time::timeout(self.block, self.notify.notified()).await;
        Ok(self.take_ready(max))
    }

    async fn claim_abandoned(&self, _max: usize) -> Result<Vec<Job>, QueueError> {
        Ok(vec![])
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
