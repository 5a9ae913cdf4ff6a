use async_trait::async_trait;
use sqlx::postgres::PgArguments;
use sqlx::query::QueryAs;
use sqlx::{PgPool, Postgres};

use crate::error::AppError;
use crate::types::{NewNotification, Notification, NotificationStatus};

use super::NotificationStore;

/// Update of the fields the delivery worker owns. `message`,
/// `notification_type`, `user_id` and `created_at` are fixed at insert.
const UPDATE_DELIVERY_STATE: &str = r#"
    UPDATE notifications
    SET status = $2,
        retry_count = $3,
        failure_reason = $4,
        last_attempt = $5,
        updated_at = now()
    WHERE id = $1
    RETURNING *
"#;

/// Postgres-backed notification store.
#[derive(Clone)]
pub struct PgNotificationStore {
    pool: PgPool,
}

impl PgNotificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn update(notification: &Notification) -> QueryAs<'_, Postgres, Notification, PgArguments> {
        sqlx::query_as(UPDATE_DELIVERY_STATE)
            .bind(notification.id)
            .bind(notification.status)
            .bind(notification.retry_count)
            .bind(&notification.failure_reason)
            .bind(notification.last_attempt)
    }
}

fn not_found(id: i64) -> AppError {
    AppError::NotFound(format!("Notification {} not found", id))
}

#[async_trait]
impl NotificationStore for PgNotificationStore {
    async fn create(&self, new: &NewNotification) -> Result<Notification, AppError> {
        let notification: Notification = sqlx::query_as(
            r#"
            INSERT INTO notifications (user_id, message, notification_type, status, retry_count)
            VALUES ($1, $2, $3, $4, 0)
            RETURNING *
            "#,
        )
        .bind(new.user_id)
        .bind(&new.message)
        .bind(new.notification_type.as_str())
        .bind(NotificationStatus::Pending)
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            notification_id = notification.id,
            user_id = notification.user_id,
            "Notification row inserted"
        );

        Ok(notification)
    }

    async fn get(&self, id: i64) -> Result<Option<Notification>, AppError> {
        let notification = sqlx::query_as("SELECT * FROM notifications WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(notification)
    }

    async fn save(&self, notification: &Notification) -> Result<Notification, AppError> {
        Self::update(notification)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| not_found(notification.id))
    }

    async fn save_durable(&self, notification: &Notification) -> Result<Notification, AppError> {
        // Force a synchronous WAL flush for this transaction even when the
        // server runs with synchronous_commit relaxed.
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET LOCAL synchronous_commit TO on")
            .execute(&mut *tx)
            .await?;
        let saved = Self::update(notification)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| not_found(notification.id))?;
        tx.commit().await?;

        Ok(saved)
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Notification>, AppError> {
        let notifications = sqlx::query_as(
            "SELECT * FROM notifications WHERE user_id = $1 ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(notifications)
    }
}
