//! Notification intake and query routes.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use herald_common::error::AppError;
use herald_common::types::NotificationResponse;

use crate::service::CreateNotificationParams;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/notifications", post(create_notification))
        .route("/api/notifications/{id}", get(get_notification))
        .route("/api/notifications/users/{user_id}", get(list_user_notifications))
}

/// POST /api/notifications: Store a notification and queue it for delivery.
async fn create_notification(
    State(state): State<AppState>,
    Json(params): Json<CreateNotificationParams>,
) -> Result<Json<NotificationResponse>, AppError> {
    let notification = state.notifications.create(&params).await?;
    Ok(Json(notification.into()))
}

/// GET /api/notifications/users/:user_id: All notifications for a user, newest first.
async fn list_user_notifications(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<Vec<NotificationResponse>>, AppError> {
    let notifications = state.notifications.list_by_user(user_id).await?;
    Ok(Json(notifications.into_iter().map(Into::into).collect()))
}

/// GET /api/notifications/:id: A single notification with its delivery state.
async fn get_notification(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<NotificationResponse>, AppError> {
    let notification = state.notifications.get(id).await?;
    Ok(Json(notification.into()))
}
