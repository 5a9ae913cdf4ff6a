//! Intake and lookup of notifications.
//!
//! Creating a notification persists it as `PENDING` first and only then
//! publishes its id for the delivery workers, so a worker never sees an id
//! the store does not know.

use std::sync::Arc;

use serde::Deserialize;

use herald_common::error::AppError;
use herald_common::store::NotificationStore;
use herald_common::types::{NewNotification, Notification, NotificationType};
use herald_notifier::queue::JobPublisher;

/// Request body for `POST /api/notifications`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateNotificationParams {
    pub user_id: i64,
    pub message: String,
    /// Channel name, e.g. `EMAIL`. Checked here so an unknown value is a 400.
    pub notification_type: String,
}

#[derive(Clone)]
pub struct NotificationService {
    store: Arc<dyn NotificationStore>,
    publisher: Arc<dyn JobPublisher>,
}

impl NotificationService {
    pub fn new(store: Arc<dyn NotificationStore>, publisher: Arc<dyn JobPublisher>) -> Self {
        Self { store, publisher }
    }

    /// Validate, persist, and enqueue a new notification.
    pub async fn create(&self, params: &CreateNotificationParams) -> Result<Notification, AppError> {
        let new = Self::validate(params)?;
        let notification = self.store.create(&new).await?;

        if let Err(e) = self.publisher.publish(notification.id).await {
            // The record stays PENDING without a job; the caller sees a 503.
            tracing::error!(
                notification_id = notification.id,
                error = %e,
                "Failed to publish delivery job"
            );
            return Err(AppError::Queue(format!(
                "notification {} stored but not queued: {}",
                notification.id, e
            )));
        }

        tracing::info!(
            notification_id = notification.id,
            user_id = notification.user_id,
            notification_type = %notification.notification_type,
            "Notification queued"
        );
        Ok(notification)
    }

    /// All notifications for a user, newest first.
    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<Notification>, AppError> {
        self.store.find_by_user(user_id).await
    }

    pub async fn get(&self, id: i64) -> Result<Notification, AppError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))
    }

    fn validate(params: &CreateNotificationParams) -> Result<NewNotification, AppError> {
        if params.message.trim().is_empty() {
            return Err(AppError::Validation("message must not be blank".to_string()));
        }

        let notification_type: NotificationType =
            params.notification_type.trim().parse().map_err(|_| {
                AppError::Validation(format!(
                    "Invalid notification_type '{}'. Valid types: {}",
                    params.notification_type,
                    NotificationType::ALL
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })?;

        Ok(NewNotification {
            user_id: params.user_id,
            message: params.message.clone(),
            notification_type,
        })
    }
}
