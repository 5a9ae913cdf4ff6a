//! Delivery worker tests against in-memory store, directory and queue.
//!
//! ```bash
//! cargo test -p herald-notifier --test worker
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use herald_common::error::AppError;
use herald_common::store::{MemoryNotificationStore, NotificationStore};
use herald_common::types::{NewNotification, Notification, NotificationStatus, NotificationType};
use herald_notifier::directory::{RecipientEntry, StaticDirectory};
use herald_notifier::policy::{AckDecision, AttemptOutcome, MAX_RETRIES_EXCEEDED, RetryPolicy};
use herald_notifier::queue::{
    AckChannel, DeliveryTag, Job, JobPublisher, JobSource, MemoryJobQueue, QueueError, QueueEvent,
};
use herald_notifier::sender::{ChannelSender, SenderRegistry};
use herald_notifier::transport::LogTransport;
use herald_notifier::worker::{DeliveryWorker, Handled, RunConfig};

// ============================================================
// Fakes
// ============================================================

/// Store wrapper that fails selected operations on demand.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryNotificationStore,
    failing_gets: AtomicUsize,
    fail_saves: AtomicBool,
    fail_durable_saves: AtomicBool,
}

impl FlakyStore {
    fn unavailable() -> AppError {
        AppError::Internal("store unavailable".to_string())
    }
}

#[async_trait]
impl NotificationStore for FlakyStore {
    async fn create(&self, new: &NewNotification) -> Result<Notification, AppError> {
        self.inner.create(new).await
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, AppError> {
        let remaining = self.failing_gets.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_gets.store(remaining - 1, Ordering::SeqCst);
            return Err(Self::unavailable());
        }
        self.inner.get(id).await
    }

    async fn save(&self, notification: &Notification) -> Result<Notification, AppError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.save(notification).await
    }

    async fn save_durable(&self, notification: &Notification) -> Result<Notification, AppError> {
        if self.fail_durable_saves.load(Ordering::SeqCst) {
            return Err(Self::unavailable());
        }
        self.inner.save_durable(notification).await
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Notification>, AppError> {
        self.inner.find_by_user(user_id).await
    }
}

/// Sender that records how often it was called and returns a fixed result.
struct CountingSender {
    calls: AtomicUsize,
    succeed: bool,
}

impl CountingSender {
    fn new(succeed: bool) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            succeed,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for CountingSender {
    async fn attempt_delivery(&self, _notification: &Notification) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.succeed
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

/// Channel that reports itself open but fails every settlement.
#[derive(Default)]
struct BrokenChannel {
    acks: AtomicUsize,
    rejects: AtomicUsize,
}

#[async_trait]
impl AckChannel for BrokenChannel {
    fn is_open(&self) -> bool {
        true
    }

    async fn ack(&self, _tag: &DeliveryTag) -> Result<(), QueueError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        Err(QueueError::Closed)
    }

    async fn reject(&self, _tag: &DeliveryTag, _requeue: bool) -> Result<(), QueueError> {
        self.rejects.fetch_add(1, Ordering::SeqCst);
        Err(QueueError::Closed)
    }
}

/// Source whose reads never complete, like `XREADGROUP BLOCK 0` on an idle stream.
#[derive(Default)]
struct StalledSource {
    closed: AtomicBool,
}

#[async_trait]
impl AckChannel for StalledSource {
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn ack(&self, _tag: &DeliveryTag) -> Result<(), QueueError> {
        Ok(())
    }

    async fn reject(&self, _tag: &DeliveryTag, _requeue: bool) -> Result<(), QueueError> {
        Ok(())
    }
}

#[async_trait]
impl JobSource for StalledSource {
    async fn recover(&self) -> Result<Vec<Job>, QueueError> {
        Ok(vec![])
    }

    async fn next_batch(&self, _max: usize) -> Result<Vec<Job>, QueueError> {
        std::future::pending().await
    }

    async fn claim_abandoned(&self, _max: usize) -> Result<Vec<Job>, QueueError> {
        Ok(vec![])
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================
// Helpers
// ============================================================

struct Harness {
    store: Arc<FlakyStore>,
    queue: Arc<MemoryJobQueue>,
    worker: Arc<DeliveryWorker>,
}

impl Harness {
    fn with_senders(senders: SenderRegistry) -> Self {
        let store = Arc::new(FlakyStore::default());
        let worker = Arc::new(DeliveryWorker::new(
            store.clone(),
            senders,
            RetryPolicy::default(),
        ));
        Self {
            store,
            queue: Arc::new(MemoryJobQueue::new()),
            worker,
        }
    }

    /// Real senders over a directory containing user 10 with email "a@b.com"
    /// plus the seeded users (user 3 has no email).
    fn standard() -> Self {
        let mut entries = HashMap::from([(10, RecipientEntry::new(Some("a@b.com"), None, None))]);
        for id in 1..=3 {
            entries.insert(id, seeded_entry(id));
        }
        let directory = Arc::new(StaticDirectory::new(entries));
        Self::with_senders(SenderRegistry::standard(directory, Arc::new(LogTransport)))
    }

    fn with_sender(channel: NotificationType, sender: Arc<CountingSender>) -> Self {
        Self::with_senders(SenderRegistry::new().with(channel, sender))
    }

    async fn create(&self, user_id: i64, notification_type: NotificationType) -> Notification {
        let created = self
            .store
            .create(&NewNotification {
                user_id,
                message: "Your order shipped".to_string(),
                notification_type,
            })
            .await
            .unwrap();
        self.queue.publish(created.id).await.unwrap();
        created
    }

    async fn current(&self, id: i64) -> Notification {
        self.store.inner.get(id).await.unwrap().unwrap()
    }

    /// Deliver the next queued job to the worker.
    async fn step(&self) -> Handled {
        let job = self.queue.deliver_next().expect("a queued job");
        self.worker.handle(&job, self.queue.as_ref()).await
    }
}

fn seeded_entry(id: i64) -> RecipientEntry {
    match id {
        1 => RecipientEntry::new(Some("test1@example.com"), Some("+911111111111"), Some("Alice")),
        2 => RecipientEntry::new(Some("test2@example.com"), Some("+922222222222"), Some("Bob")),
        _ => RecipientEntry::new(None, Some("+933333333333"), Some("Charlie")),
    }
}

const REQUEUE: AckDecision = AckDecision::Reject { requeue: true };
const DISCARD: AckDecision = AckDecision::Reject { requeue: false };

// ============================================================
// Single-attempt behavior
// ============================================================

#[tokio::test]
async fn test_successful_email_is_sent_and_acked_once() {
    let h = Harness::standard();
    let n = h.create(10, NotificationType::Email).await;

    let handled = h.step().await;

    assert_eq!(handled.outcome, AttemptOutcome::Sent);
    assert_eq!(handled.ack, AckDecision::Ack);
    let stored = h.current(n.id).await;
    assert_eq!(stored.status, NotificationStatus::Sent);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.last_attempt.is_some());
    assert_eq!(
        h.queue.events(),
        vec![QueueEvent::Ack {
            notification_id: n.id
        }]
    );
    assert_eq!(h.queue.in_flight_len(), 0);
}

#[tokio::test]
async fn test_missing_email_walks_retry_budget_to_failed() {
    let h = Harness::standard();
    let n = h.create(3, NotificationType::Email).await;

    let first = h.step().await;
    assert_eq!(first.outcome, AttemptOutcome::RecoverableFailure);
    assert_eq!(first.ack, REQUEUE);
    let stored = h.current(n.id).await;
    assert_eq!((stored.status, stored.retry_count), (NotificationStatus::Pending, 1));

    let second = h.step().await;
    assert_eq!(second.ack, REQUEUE);
    let stored = h.current(n.id).await;
    assert_eq!((stored.status, stored.retry_count), (NotificationStatus::Pending, 2));

    let third = h.step().await;
    assert_eq!(third.ack, DISCARD);
    let stored = h.current(n.id).await;
    assert_eq!((stored.status, stored.retry_count), (NotificationStatus::Failed, 3));
    assert_eq!(stored.failure_reason.as_deref(), Some(MAX_RETRIES_EXCEEDED));

    assert_eq!(
        h.queue.events(),
        vec![
            QueueEvent::Reject {
                notification_id: n.id,
                requeue: true
            },
            QueueEvent::Reject {
                notification_id: n.id,
                requeue: true
            },
            QueueEvent::Reject {
                notification_id: n.id,
                requeue: false
            },
        ]
    );
    assert_eq!(h.queue.ready_len(), 0);
    assert_eq!(h.queue.dead_letters().len(), 1);
}

#[tokio::test]
async fn test_redelivered_sent_notification_is_acked_without_sending() {
    let sender = CountingSender::new(true);
    let h = Harness::with_sender(NotificationType::Email, sender.clone());
    let n = h.create(1, NotificationType::Email).await;

    h.step().await;
    assert_eq!(sender.calls(), 1);

    // The broker hands the same id out again.
    h.queue.publish(n.id).await.unwrap();
    let handled = h.step().await;

    assert_eq!(handled.outcome, AttemptOutcome::Duplicate);
    assert_eq!(handled.ack, AckDecision::Ack);
    assert_eq!(sender.calls(), 1);
    assert_eq!(
        h.queue.events(),
        vec![
            QueueEvent::Ack {
                notification_id: n.id
            },
            QueueEvent::Ack {
                notification_id: n.id
            },
        ]
    );
}

#[tokio::test]
async fn test_failed_notification_is_never_retried() {
    let sender = CountingSender::new(true);
    let h = Harness::with_sender(NotificationType::Sms, sender.clone());
    let mut n = h.create(1, NotificationType::Sms).await;
    n.status = NotificationStatus::Failed;
    n.retry_count = 3;
    h.store.save(&n).await.unwrap();

    let handled = h.step().await;

    assert_eq!(handled.outcome, AttemptOutcome::Duplicate);
    assert_eq!(sender.calls(), 0);
    let stored = h.current(n.id).await;
    assert_eq!((stored.status, stored.retry_count), (NotificationStatus::Failed, 3));
}

#[tokio::test]
async fn test_unknown_type_fails_without_sending() {
    let sender = CountingSender::new(true);
    let h = Harness::with_sender(NotificationType::Email, sender.clone());
    let template = h.create(1, NotificationType::Email).await;
    h.queue.deliver_next();

    // A row whose stored type no longer maps to a channel.
    let drifted = Notification {
        id: 500,
        notification_type: "CARRIER_PIGEON".to_string(),
        ..template
    };
    h.store.inner.insert(drifted).await;
    h.queue.publish(500).await.unwrap();

    let handled = h.step().await;

    assert_eq!(
        handled.outcome,
        AttemptOutcome::PermanentFailure {
            reason: "invalid type: CARRIER_PIGEON".to_string()
        }
    );
    assert_eq!(handled.ack, DISCARD);
    let failed = h.current(500).await;
    assert_eq!((failed.status, failed.retry_count), (NotificationStatus::Failed, 0));
    assert_eq!(
        failed.failure_reason.as_deref(),
        Some("invalid type: CARRIER_PIGEON")
    );
    assert_eq!(sender.calls(), 0);
}

#[tokio::test]
async fn test_unregistered_type_fails_without_sending() {
    let sender = CountingSender::new(true);
    let h = Harness::with_sender(NotificationType::Email, sender.clone());
    let n = h.create(1, NotificationType::InApp).await;

    let handled = h.step().await;

    assert_eq!(handled.ack, DISCARD);
    let stored = h.current(n.id).await;
    assert_eq!(stored.status, NotificationStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("invalid type: IN_APP"));
    assert_eq!(sender.calls(), 0);
}

#[tokio::test]
async fn test_missing_record_is_discarded() {
    let h = Harness::standard();
    h.queue.publish(9999).await.unwrap();

    let handled = h.step().await;

    assert_eq!(handled.outcome, AttemptOutcome::Missing);
    assert_eq!(handled.ack, DISCARD);
    assert!(h.store.inner.is_empty().await);
}

// ============================================================
// Infrastructure failures
// ============================================================

#[tokio::test]
async fn test_store_read_failure_requeues_without_consuming_budget() {
    let sender = CountingSender::new(true);
    let h = Harness::with_sender(NotificationType::Email, sender.clone());
    let n = h.create(1, NotificationType::Email).await;
    h.store.failing_gets.store(1, Ordering::SeqCst);

    let handled = h.step().await;

    assert_eq!(handled.outcome, AttemptOutcome::InfraError);
    assert_eq!(handled.ack, REQUEUE);
    assert_eq!(sender.calls(), 0);
    let stored = h.current(n.id).await;
    assert_eq!((stored.status, stored.retry_count), (NotificationStatus::Pending, 0));
    assert_eq!(h.queue.ready_len(), 1);

    // Store is back: the requeued job now goes through.
    let handled = h.step().await;
    assert_eq!(handled.outcome, AttemptOutcome::Sent);
}

#[tokio::test]
async fn test_durable_write_failure_after_send_requeues() {
    let sender = CountingSender::new(true);
    let h = Harness::with_sender(NotificationType::Email, sender.clone());
    let n = h.create(1, NotificationType::Email).await;
    h.store.fail_durable_saves.store(true, Ordering::SeqCst);

    let handled = h.step().await;

    assert_eq!(handled.outcome, AttemptOutcome::Sent);
    assert_eq!(handled.ack, REQUEUE);
    assert_eq!(sender.calls(), 1);
    let stored = h.current(n.id).await;
    assert_eq!((stored.status, stored.retry_count), (NotificationStatus::Pending, 0));
    assert!(
        !h.queue
            .events()
            .iter()
            .any(|e| matches!(e, QueueEvent::Ack { .. }))
    );
}

#[tokio::test]
async fn test_retry_write_failure_keeps_count_and_requeues() {
    let sender = CountingSender::new(false);
    let h = Harness::with_sender(NotificationType::Sms, sender.clone());
    let n = h.create(1, NotificationType::Sms).await;
    h.store.fail_saves.store(true, Ordering::SeqCst);

    let handled = h.step().await;

    assert_eq!(handled.outcome, AttemptOutcome::RecoverableFailure);
    assert_eq!(handled.ack, REQUEUE);
    let stored = h.current(n.id).await;
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn test_closed_channel_keeps_persisted_state() {
    let h = Harness::standard();
    let n = h.create(10, NotificationType::Email).await;
    let job = h.queue.deliver_next().unwrap();
    h.queue.close();

    let handled = h.worker.handle(&job, h.queue.as_ref()).await;

    assert_eq!(handled.ack, AckDecision::Ack);
    assert!(h.queue.events().is_empty());
    assert_eq!(h.queue.in_flight_len(), 1);
    assert_eq!(h.current(n.id).await.status, NotificationStatus::Sent);
}

#[tokio::test]
async fn test_closed_channel_reject_keeps_retry_state() {
    let h = Harness::standard();
    let n = h.create(3, NotificationType::Email).await;
    let job = h.queue.deliver_next().unwrap();
    h.queue.close();

    let handled = h.worker.handle(&job, h.queue.as_ref()).await;

    assert_eq!(handled.ack, REQUEUE);
    assert!(h.queue.events().is_empty());
    assert_eq!(h.queue.ready_len(), 0);
    let stored = h.current(n.id).await;
    assert_eq!((stored.status, stored.retry_count), (NotificationStatus::Pending, 1));
}

#[tokio::test]
async fn test_ack_error_on_open_channel_is_absorbed() {
    let h = Harness::standard();
    let n = h.create(10, NotificationType::Email).await;
    let job = h.queue.deliver_next().unwrap();
    let channel = BrokenChannel::default();

    let handled = h.worker.handle(&job, &channel).await;

    assert_eq!(handled.ack, AckDecision::Ack);
    assert_eq!(channel.acks.load(Ordering::SeqCst), 1);
    assert_eq!(channel.rejects.load(Ordering::SeqCst), 0);
    assert_eq!(h.current(n.id).await.status, NotificationStatus::Sent);
}

#[tokio::test]
async fn test_reject_error_on_open_channel_is_absorbed() {
    let h = Harness::standard();
    let n = h.create(3, NotificationType::Email).await;
    let job = h.queue.deliver_next().unwrap();
    let channel = BrokenChannel::default();

    let handled = h.worker.handle(&job, &channel).await;

    assert_eq!(handled.ack, REQUEUE);
    assert_eq!(channel.acks.load(Ordering::SeqCst), 0);
    assert_eq!(channel.rejects.load(Ordering::SeqCst), 1);
    assert_eq!(h.current(n.id).await.retry_count, 1);
}

// ============================================================
// Consume loop
// ============================================================

#[tokio::test]
async fn test_run_loop_stops_while_read_is_stalled() {
    let h = Harness::standard();
    let source = Arc::new(StalledSource::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(
        h.worker
            .clone()
            .run(source.clone(), RunConfig::default(), shutdown_rx),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(2), handle).await;
    assert!(stopped.is_ok(), "worker did not stop during a stalled read");
    stopped.unwrap().unwrap().unwrap();
    assert!(!source.is_open());
}

async fn wait_until_settled(store: &FlakyStore, ids: &[i64]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let mut settled = true;
        for id in ids {
            let n = store.inner.get(*id).await.unwrap().unwrap();
            settled &= n.status.is_terminal();
        }
        if settled {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "notifications did not settle in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_run_loop_settles_all_jobs_and_stops_on_shutdown() {
    let h = Harness::standard();
    let sent_email = h.create(1, NotificationType::Email).await;
    let sent_sms = h.create(3, NotificationType::Sms).await;
    let failed_email = h.create(3, NotificationType::Email).await;
    let sent_in_app = h.create(2, NotificationType::InApp).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let config = RunConfig {
        prefetch: 2,
        claim_interval: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(1),
    };
    let handle = tokio::spawn(h.worker.clone().run(h.queue.clone(), config, shutdown_rx));

    wait_until_settled(
        &h.store,
        &[sent_email.id, sent_sms.id, failed_email.id, sent_in_app.id],
    )
    .await;
    shutdown_tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    for id in [sent_email.id, sent_sms.id, sent_in_app.id] {
        let n = h.current(id).await;
        assert_eq!((n.status, n.retry_count), (NotificationStatus::Sent, 0));
    }
    let failed = h.current(failed_email.id).await;
    assert_eq!((failed.status, failed.retry_count), (NotificationStatus::Failed, 3));

    let events = h.queue.events();
    let acks = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::Ack { .. }))
        .count();
    let requeues = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::Reject { requeue: true, .. }))
        .count();
    let discards = events
        .iter()
        .filter(|e| matches!(e, QueueEvent::Reject { requeue: false, .. }))
        .count();
    assert_eq!((acks, requeues, discards), (3, 2, 1));
    assert_eq!(h.queue.in_flight_len(), 0);
    assert!(!h.queue.is_open());
}
