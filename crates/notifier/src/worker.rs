//! Delivery worker.
//!
//! For each job:
//! 1. Load the notification (missing → discard, store error → requeue)
//! 2. Short-circuit records already in a terminal state (ack)
//! 3. Stamp `last_attempt` and dispatch to the sender for its type
//! 4. Ask the [`RetryPolicy`] what the outcome means
//! 5. Persist the transition, then ack or reject the message
//!
//! The store write always happens before the broker is told anything. If the
//! write fails the message is requeued, so a crash or a flaky store can cause
//! a repeat delivery but never a lost one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use herald_common::config::AppConfig;
use herald_common::error::AppError;
use herald_common::store::NotificationStore;
use herald_common::types::Notification;

use crate::policy::{AckDecision, AttemptOutcome, RetryPolicy, Transition};
use crate::queue::{AckChannel, DeliveryTag, Job, JobSource, QueueError};
use crate::sender::{DispatchError, SenderRegistry};

/// Upper bound for the backoff after consecutive broker errors.
const MAX_BACKOFF_SECS: u64 = 30;

/// Acknowledge a message, logging instead of failing.
///
/// A closed channel or an I/O error means the broker will eventually hand
/// the message out again; retrying the ack here would not help.
pub async fn safe_ack(channel: &dyn AckChannel, tag: &DeliveryTag) {
    if !channel.is_open() {
        tracing::error!(entry_id = %tag, "Channel closed - message lost");
        return;
    }
    if let Err(e) = channel.ack(tag).await {
        tracing::error!(entry_id = %tag, error = %e, "Failed to ACK message");
    }
}

/// Reject a message, logging instead of failing. See [`safe_ack`].
pub async fn safe_reject(channel: &dyn AckChannel, tag: &DeliveryTag, requeue: bool) {
    if !channel.is_open() {
        tracing::error!(entry_id = %tag, requeue, "Channel closed - message lost");
        return;
    }
    if let Err(e) = channel.reject(tag, requeue).await {
        tracing::error!(entry_id = %tag, requeue, error = %e, "Failed to REJECT message");
    }
}

/// What happened to one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub outcome: AttemptOutcome,
    /// Broker decision actually issued. Differs from the policy's decision
    /// when persisting the transition failed.
    pub ack: AckDecision,
}

/// Loop tuning for [`DeliveryWorker::run`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Maximum number of jobs handled concurrently.
    pub prefetch: usize,
    /// How often to look for jobs abandoned by other consumers.
    pub claim_interval: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace: Duration,
}

impl RunConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            prefetch: config.worker_prefetch,
            claim_interval: Duration::from_millis(config.worker_claim_idle_ms.max(1000)),
            shutdown_grace: Duration::from_secs(config.worker_shutdown_grace_secs),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            prefetch: 10,
            claim_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

pub struct DeliveryWorker {
    store: Arc<dyn NotificationStore>,
    senders: SenderRegistry,
    policy: RetryPolicy,
}

impl DeliveryWorker {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        senders: SenderRegistry,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            senders,
            policy,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one delivery attempt without touching the queue or persisting
    /// anything. Returns the outcome and the record as it stood after the
    /// attempt (with `last_attempt` stamped), when there is one.
    pub async fn attempt(&self, notification_id: i64) -> (AttemptOutcome, Option<Notification>) {
        let notification = match self.store.get(notification_id).await {
            Ok(Some(n)) => n,
            Ok(None) => {
                tracing::error!(notification_id, "Notification not found");
                return (AttemptOutcome::Missing, None);
            }
            Err(e) => {
                tracing::error!(notification_id, error = %e, "Store error loading notification");
                return (AttemptOutcome::InfraError, None);
            }
        };

        // Redelivered job for a finished record: nothing left to do.
        if notification.status.is_terminal() {
            tracing::info!(
                notification_id,
                status = %notification.status,
                "Notification already settled, skipping"
            );
            return (AttemptOutcome::Duplicate, Some(notification));
        }

        tracing::info!(
            notification_id,
            notification_type = %notification.notification_type,
            retry_count = notification.retry_count,
            "Processing notification"
        );

        let mut notification = notification;
        notification.last_attempt = Some(Utc::now());

        let outcome = match self.senders.dispatch(&notification).await {
            Ok(true) => AttemptOutcome::Sent,
            Ok(false) => AttemptOutcome::RecoverableFailure,
            Err(DispatchError::UnsupportedType(ty)) => AttemptOutcome::PermanentFailure {
                reason: format!("invalid type: {}", ty),
            },
        };

        (outcome, Some(notification))
    }

    /// Handle one job end to end and settle its message on `channel`.
    pub async fn handle(&self, job: &Job, channel: &dyn AckChannel) -> Handled {
        let notification_id = job.notification_id;
        let (outcome, notification) = self.attempt(notification_id).await;
        let retry_count = notification.as_ref().map(|n| n.retry_count).unwrap_or(0);
        let decision = self.policy.decide(&outcome, retry_count);

        let mut ack = decision.ack;
        let updated = notification
            .as_ref()
            .and_then(|n| decision.transition.apply(n));

        if let Some(updated) = updated {
            match self
                .persist(&updated, decision.transition.requires_durable_write())
                .await
            {
                Ok(_) => log_transition(notification_id, &decision.transition),
                Err(e) => {
                    // The delivery may already have happened; requeue and let
                    // the next attempt redo it rather than ack an unrecorded state.
                    tracing::error!(
                        notification_id,
                        error = %e,
                        transition = ?decision.transition,
                        "Failed to persist delivery state, requeueing"
                    );
                    ack = AckDecision::Reject { requeue: true };
                }
            }
        }

        match ack {
            AckDecision::Ack => safe_ack(channel, &job.tag).await,
            AckDecision::Reject { requeue } => safe_reject(channel, &job.tag, requeue).await,
        }

        Handled { outcome, ack }
    }

    async fn persist(
        &self,
        notification: &Notification,
        durable: bool,
    ) -> Result<Notification, AppError> {
        if durable {
            self.store.save_durable(notification).await
        } else {
            self.store.save(notification).await
        }
    }

    /// Consume jobs until `shutdown` flips to `true`.
    ///
    /// Each job runs on its own task; at most `config.prefetch` run at once.
    /// On shutdown, in-flight jobs get `config.shutdown_grace` to finish.
    /// After that the channel is closed and stragglers are aborted; their
    /// messages stay unsettled and are delivered again later.
    pub async fn run<Q>(
        self: Arc<Self>,
        queue: Arc<Q>,
        config: RunConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError>
    where
        Q: JobSource + 'static,
    {
        let prefetch = config.prefetch.max(1);
        let semaphore = Arc::new(Semaphore::new(prefetch));
        let mut tasks: JoinSet<()> = JoinSet::new();

        tracing::info!(
            prefetch,
            max_attempts = self.policy.max_attempts(),
            "Delivery worker started"
        );

        match queue.recover().await {
            Ok(jobs) => {
                for job in jobs {
                    self.spawn_job(&mut tasks, &semaphore, &queue, job).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to recover pending jobs"),
        }

        let mut consecutive_errors: u32 = 0;
        let mut last_claim = Instant::now();

        loop {
            if *shutdown.borrow() {
                tracing::info!("Received shutdown signal, stopping worker");
                break;
            }

            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    tracing::error!(error = %e, "Delivery task panicked");
                }
            }

            let capacity = semaphore.available_permits();
            if capacity == 0 {
                tokio::select! {
                    _ = tasks.join_next() => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            // A read cancelled by shutdown leaves any entries it took pending;
            // `recover` hands them out again on the next start.
            let batch = tokio::select! {
                batch = queue.next_batch(capacity) => batch,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        tracing::warn!("Shutdown sender dropped, stopping worker");
                        break;
                    }
                    continue;
                }
            };
            match batch {
                Ok(jobs) => {
                    if consecutive_errors > 0 {
                        tracing::info!(consecutive_errors, "Queue connection recovered");
                        consecutive_errors = 0;
                    }
                    for job in jobs {
                        self.spawn_job(&mut tasks, &semaphore, &queue, job).await;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs = if e.is_connection_error() {
                        2u64.pow(consecutive_errors.min(5)).min(MAX_BACKOFF_SECS)
                    } else {
                        1
                    };
                    tracing::warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Failed to read jobs, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            }

            if last_claim.elapsed() >= config.claim_interval {
                last_claim = Instant::now();
                let capacity = semaphore.available_permits();
                if capacity > 0 {
                    match queue.claim_abandoned(capacity).await {
                        Ok(jobs) => {
                            for job in jobs {
                                self.spawn_job(&mut tasks, &semaphore, &queue, job).await;
                            }
                        }
                        Err(e) => tracing::debug!(error = %e, "Failed to claim abandoned jobs"),
                    }
                }
            }
        }

        tracing::info!(in_flight = tasks.len(), "Draining in-flight deliveries");
        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        queue.close();

        if drained.is_err() {
            tracing::warn!(
                remaining = tasks.len(),
                "Shutdown grace period elapsed, aborting remaining deliveries"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        tracing::info!("Delivery worker stopped");
        Ok(())
    }

    async fn spawn_job<Q>(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        queue: &Arc<Q>,
        job: Job,
    ) where
        Q: JobSource + 'static,
    {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            return;
        };
        let worker = Arc::clone(self);
        let queue = Arc::clone(queue);

        tasks.spawn(async move {
            let _permit = permit;
            worker.handle(&job, &*queue).await;
        });
    }
}

fn log_transition(notification_id: i64, transition: &Transition) {
    match transition {
        Transition::None => {}
        Transition::MarkSent => {
            tracing::info!(notification_id, "Notification marked as SENT");
        }
        Transition::Retry { retry_count } => {
            tracing::warn!(notification_id, attempt = retry_count, "Delivery failed, retrying");
        }
        Transition::MarkFailed {
            retry_count,
            reason,
        } => {
            tracing::error!(
                notification_id,
                retry_count,
                reason = %reason,
                "Notification permanently failed"
            );
        }
    }
}
