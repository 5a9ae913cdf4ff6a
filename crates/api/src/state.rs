//! Shared application state for the Axum API server.

use std::sync::Arc;

use herald_common::store::NotificationStore;
use herald_notifier::queue::JobPublisher;

use crate::service::NotificationService;

/// Application state shared across all route handlers via Axum `State`.
#[derive(Clone)]
pub struct AppState {
    pub notifications: NotificationService,
}

impl AppState {
    pub fn new(store: Arc<dyn NotificationStore>, publisher: Arc<dyn JobPublisher>) -> Self {
        Self {
            notifications: NotificationService::new(store, publisher),
        }
    }
}
