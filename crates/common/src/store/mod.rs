//! Notification store: durable record storage keyed by notification id.
//!
//! The delivery worker and the intake API only see the [`NotificationStore`]
//! trait. Postgres backs production deployments; the in-memory store backs
//! local runs and tests.

mod memory;
mod postgres;

pub use memory::MemoryNotificationStore;
pub use postgres::PgNotificationStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{AppConfig, StoreBackend};
use crate::db;
use crate::error::AppError;
use crate::types::{NewNotification, Notification};

#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Insert a new `Pending` record with a zero retry count.
    async fn create(&self, new: &NewNotification) -> Result<Notification, AppError>;

    /// Fetch a record by id. `Ok(None)` when it does not exist.
    async fn get(&self, id: i64) -> Result<Option<Notification>, AppError>;

    /// Write the delivery state of an existing record and refresh `updated_at`.
    /// Fails with `AppError::NotFound` when no record has that id.
    async fn save(&self, notification: &Notification) -> Result<Notification, AppError>;

    /// Like [`save`](Self::save), but the write is flushed to durable storage
    /// before this returns.
    async fn save_durable(&self, notification: &Notification) -> Result<Notification, AppError>;

    /// All records addressed to a user, newest first.
    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Notification>, AppError>;
}

/// Open the store selected by `STORE_BACKEND`, applying migrations for Postgres.
pub async fn connect_store(config: &AppConfig) -> anyhow::Result<Arc<dyn NotificationStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required for the postgres store"))?;
            let pool = db::create_pool(url, config.db_max_connections).await?;
            db::migrate(&pool).await?;
            Ok(Arc::new(PgNotificationStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory notification store; records are lost on restart");
            Ok(Arc::new(MemoryNotificationStore::new()))
        }
    }
}
