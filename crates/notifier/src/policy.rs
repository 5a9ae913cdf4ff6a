//! Retry and acknowledgment policy.
//!
//! Every delivery attempt ends in an [`AttemptOutcome`]. [`RetryPolicy::decide`]
//! turns that outcome plus the record's current retry count into the state
//! transition to persist and the broker decision to take afterwards. Nothing
//! here touches the store or the queue.

use herald_common::types::{Notification, NotificationStatus};

/// Failure reason stored when the retry budget runs out.
pub const MAX_RETRIES_EXCEEDED: &str = "max retries exceeded";

/// Default number of total delivery attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Result of one delivery attempt for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The job references a record that does not exist.
    Missing,
    /// The record is already in a terminal state (redelivered job).
    Duplicate,
    /// The sender delivered the notification.
    Sent,
    /// The sender reported failure; counts against the retry budget.
    RecoverableFailure,
    /// The record can never be delivered.
    PermanentFailure { reason: String },
    /// The store failed. Does not count against the retry budget.
    InfraError,
}

/// What to tell the broker about the job's message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Reject { requeue: bool },
}

/// State change to persist before the ack decision is carried out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    None,
    MarkSent,
    Retry { retry_count: i32 },
    MarkFailed { retry_count: i32, reason: String },
}

impl Transition {
    /// `MarkSent` must be flushed to durable storage before the job is acked.
    pub fn requires_durable_write(&self) -> bool {
        matches!(self, Transition::MarkSent)
    }

    /// Apply the transition to a record. Returns `None` when there is nothing to persist.
    pub fn apply(&self, notification: &Notification) -> Option<Notification> {
        let mut updated = notification.clone();
        match self {
            Transition::None => return None,
            Transition::MarkSent => {
                updated.status = NotificationStatus::Sent;
                updated.retry_count = 0;
                updated.failure_reason = None;
            }
            Transition::Retry { retry_count } => {
                updated.status = NotificationStatus::Pending;
                updated.retry_count = *retry_count;
            }
            Transition::MarkFailed {
                retry_count,
                reason,
            } => {
                updated.status = NotificationStatus::Failed;
                updated.retry_count = *retry_count;
                updated.failure_reason = Some(reason.clone());
            }
        }
        Some(updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub transition: Transition,
    pub ack: AckDecision,
}

impl Decision {
    fn new(transition: Transition, ack: AckDecision) -> Self {
        Self { transition, ack }
    }
}

/// Bounded retry budget, counted in total attempts.
///
/// With `max_attempts = 3` a notification gets three tries: the failing third
/// attempt raises the count to 3 and the record is marked failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn decide(&self, outcome: &AttemptOutcome, retry_count: i32) -> Decision {
        match outcome {
            AttemptOutcome::Missing => {
                Decision::new(Transition::None, AckDecision::Reject { requeue: false })
            }
            AttemptOutcome::Duplicate => Decision::new(Transition::None, AckDecision::Ack),
            AttemptOutcome::Sent => Decision::new(Transition::MarkSent, AckDecision::Ack),
            AttemptOutcome::InfraError => {
                Decision::new(Transition::None, AckDecision::Reject { requeue: true })
            }
            AttemptOutcome::PermanentFailure { reason } => Decision::new(
                Transition::MarkFailed {
                    retry_count,
                    reason: reason.clone(),
                },
                AckDecision::Reject { requeue: false },
            ),
            AttemptOutcome::RecoverableFailure => {
                let next = retry_count.saturating_add(1);
                if next as i64 >= self.max_attempts as i64 {
                    Decision::new(
                        Transition::MarkFailed {
                            retry_count: next,
                            reason: MAX_RETRIES_EXCEEDED.to_string(),
                        },
                        AckDecision::Reject { requeue: false },
                    )
                } else {
                    Decision::new(
                        Transition::Retry { retry_count: next },
                        AckDecision::Reject { requeue: true },
                    )
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}
