use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delivery channel of a notification. Determines which sender is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Email,
    Sms,
    InApp,
}

impl NotificationType {
    pub const ALL: [NotificationType; 3] = [
        NotificationType::Email,
        NotificationType::Sms,
        NotificationType::InApp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Email => "EMAIL",
            NotificationType::Sms => "SMS",
            NotificationType::InApp => "IN_APP",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored notification type that does not map to any known channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported notification type '{0}'")]
pub struct UnsupportedType(pub String);

impl FromStr for NotificationType {
    type Err = UnsupportedType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EMAIL" => Ok(NotificationType::Email),
            "SMS" => Ok(NotificationType::Sms),
            "IN_APP" => Ok(NotificationType::InApp),
            other => Err(UnsupportedType(other.to_string())),
        }
    }
}

/// Notification delivery status.
///
/// `Sent` and `Failed` are terminal: the delivery worker never moves a record
/// out of either state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NotificationStatus::Sent | NotificationStatus::Failed)
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationStatus::Pending => write!(f, "PENDING"),
            NotificationStatus::Sent => write!(f, "SENT"),
            NotificationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// A notification record as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub user_id: i64,
    pub message: String,
    /// Raw stored channel name. Kept as text so a value the worker no longer
    /// understands still loads and can be failed as an invalid type.
    pub notification_type: String,
    pub status: NotificationStatus,
    pub retry_count: i32,
    /// Why the record ended up `Failed`, if it did.
    pub failure_reason: Option<String>,
    /// Start of the most recent delivery attempt. Set by the worker.
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    /// Parse the stored channel name.
    pub fn channel(&self) -> Result<NotificationType, UnsupportedType> {
        self.notification_type.parse()
    }
}

/// Input for creating a notification. New records always start `Pending`
/// with a zero retry count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: i64,
    pub message: String,
    pub notification_type: NotificationType,
}

/// Public projection of a notification returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub id: i64,
    pub user_id: i64,
    pub message: String,
    pub notification_type: String,
    pub status: NotificationStatus,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Notification> for NotificationResponse {
    fn from(n: Notification) -> Self {
        Self {
            id: n.id,
            user_id: n.user_id,
            message: n.message,
            notification_type: n.notification_type,
            status: n.status,
            retry_count: n.retry_count,
            failure_reason: n.failure_reason,
            last_attempt: n.last_attempt,
            created_at: n.created_at,
            updated_at: n.updated_at,
        }
    }
}
