use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::AppError;
use crate::types::{NewNotification, Notification, NotificationStatus};

use super::NotificationStore;

/// In-process notification store. Every write is "durable" for the lifetime
/// of the process, so `save_durable` is the same as `save`.
#[derive(Default)]
pub struct MemoryNotificationStore {
    records: RwLock<HashMap<i64, Notification>>,
    next_id: AtomicI64,
}

impl MemoryNotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Store a record as-is under its own id, replacing any existing one.
    /// Generated ids stay ahead of explicitly inserted ones.
    pub async fn insert(&self, notification: Notification) -> Notification {
        self.next_id.fetch_max(notification.id, Ordering::SeqCst);
        self.records
            .write()
            .await
            .insert(notification.id, notification.clone());
        notification
    }
}

#[async_trait]
impl NotificationStore for MemoryNotificationStore {
    async fn create(&self, new: &NewNotification) -> Result<Notification, AppError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let notification = Notification {
            id,
            user_id: new.user_id,
            message: new.message.clone(),
            notification_type: new.notification_type.as_str().to_string(),
            status: NotificationStatus::Pending,
            retry_count: 0,
            failure_reason: None,
            last_attempt: None,
            created_at: now,
            updated_at: now,
        };

        self.records.write().await.insert(id, notification.clone());
        Ok(notification)
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, AppError> {
        Ok(self.records.read().await.get(&id).cloned())
    }

    async fn save(&self, notification: &Notification) -> Result<Notification, AppError> {
        let mut records = self.records.write().await;
        let existing = records.get(&notification.id).ok_or_else(|| {
            AppError::NotFound(format!("Notification {} not found", notification.id))
        })?;

        let saved = Notification {
            user_id: existing.user_id,
            message: existing.message.clone(),
            notification_type: existing.notification_type.clone(),
            created_at: existing.created_at,
            updated_at: Utc::now(),
            ..notification.clone()
        };
        records.insert(saved.id, saved.clone());
        Ok(saved)
    }

    async fn save_durable(&self, notification: &Notification) -> Result<Notification, AppError> {
        self.save(notification).await
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Notification>, AppError> {
        let mut found: Vec<Notification> = self
            .records
            .read()
            .await
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(found)
    }
}
