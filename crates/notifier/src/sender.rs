//! Channel senders and the registry that routes a notification to one.
//!
//! A sender never raises for expected failures: a recipient without the
//! needed contact attribute, or a transport error, is reported as `false`.
//! The only error surfaced to the worker is a notification type no sender is
//! registered for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use herald_common::types::{Notification, NotificationType};

use crate::directory::RecipientDirectory;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unsupported notification type '{0}'")]
    UnsupportedType(String),
}

/// Capability to attempt delivery over one medium.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    /// Returns `true` only when the recipient was resolved and the transport
    /// accepted the message.
    async fn attempt_delivery(&self, notification: &Notification) -> bool;

    fn name(&self) -> &'static str;
}

/// Hand an addressed message to the transport, folding errors into `false`.
async fn deliver(
    transport: &dyn Transport,
    channel: NotificationType,
    notification: &Notification,
    address: Option<String>,
    attribute: &'static str,
) -> bool {
    let Some(address) = address else {
        tracing::error!(
            notification_id = notification.id,
            user_id = notification.user_id,
            channel = %channel,
            attribute,
            "No {} found for user",
            attribute
        );
        return false;
    };

    match transport
        .deliver(channel, &address, &notification.message)
        .await
    {
        Ok(()) => {
            tracing::info!(
                notification_id = notification.id,
                channel = %channel,
                transport = transport.name(),
                "Notification handed to transport"
            );
            true
        }
        Err(e) => {
            tracing::warn!(
                notification_id = notification.id,
                channel = %channel,
                transport = transport.name(),
                error = %e,
                "Transport failed"
            );
            false
        }
    }
}

/// Sends to the user's email address.
pub struct EmailSender {
    directory: Arc<dyn RecipientDirectory>,
    transport: Arc<dyn Transport>,
}

impl EmailSender {
    pub fn new(directory: Arc<dyn RecipientDirectory>, transport: Arc<dyn Transport>) -> Self {
        Self {
            directory,
            transport,
        }
    }
}

#[async_trait]
impl ChannelSender for EmailSender {
    async fn attempt_delivery(&self, notification: &Notification) -> bool {
        let email = self.directory.resolve_email(notification.user_id).await;
        deliver(
            self.transport.as_ref(),
            NotificationType::Email,
            notification,
            email,
            "email",
        )
        .await
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

/// Sends a text message to the user's phone number.
pub struct SmsSender {
    directory: Arc<dyn RecipientDirectory>,
    transport: Arc<dyn Transport>,
}

impl SmsSender {
    pub fn new(directory: Arc<dyn RecipientDirectory>, transport: Arc<dyn Transport>) -> Self {
        Self {
            directory,
            transport,
        }
    }
}

#[async_trait]
impl ChannelSender for SmsSender {
    async fn attempt_delivery(&self, notification: &Notification) -> bool {
        let phone = self.directory.resolve_phone(notification.user_id).await;
        deliver(
            self.transport.as_ref(),
            NotificationType::Sms,
            notification,
            phone,
            "phone number",
        )
        .await
    }

    fn name(&self) -> &'static str {
        "sms"
    }
}

/// Posts to the user's in-app inbox, addressed by display name.
pub struct InAppSender {
    directory: Arc<dyn RecipientDirectory>,
    transport: Arc<dyn Transport>,
}

impl InAppSender {
    pub fn new(directory: Arc<dyn RecipientDirectory>, transport: Arc<dyn Transport>) -> Self {
        Self {
            directory,
            transport,
        }
    }
}

#[async_trait]
impl ChannelSender for InAppSender {
    async fn attempt_delivery(&self, notification: &Notification) -> bool {
        let name = self
            .directory
            .resolve_display_name(notification.user_id)
            .await;
        deliver(
            self.transport.as_ref(),
            NotificationType::InApp,
            notification,
            name,
            "display name",
        )
        .await
    }

    fn name(&self) -> &'static str {
        "in_app"
    }
}

/// Maps each notification type to its sender. Built once at startup.
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<NotificationType, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the email, SMS and in-app senders sharing one directory
    /// and one transport.
    pub fn standard(directory: Arc<dyn RecipientDirectory>, transport: Arc<dyn Transport>) -> Self {
        Self::new()
            .with(
                NotificationType::Email,
                Arc::new(EmailSender::new(directory.clone(), transport.clone())),
            )
            .with(
                NotificationType::Sms,
                Arc::new(SmsSender::new(directory.clone(), transport.clone())),
            )
            .with(
                NotificationType::InApp,
                Arc::new(InAppSender::new(directory, transport)),
            )
    }

    /// Register (or replace) the sender for a type.
    pub fn with(mut self, channel: NotificationType, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel, sender);
        self
    }

    pub fn get(&self, channel: NotificationType) -> Option<&Arc<dyn ChannelSender>> {
        self.senders.get(&channel)
    }

    /// Route a notification to the sender for its stored type.
    pub async fn dispatch(&self, notification: &Notification) -> Result<bool, DispatchError> {
        let channel = notification
            .channel()
            .map_err(|e| DispatchError::UnsupportedType(e.0))?;
        let sender = self
            .get(channel)
            .ok_or_else(|| DispatchError::UnsupportedType(channel.to_string()))?;

        tracing::debug!(
            notification_id = notification.id,
            sender = sender.name(),
            "Dispatching notification"
        );

        Ok(sender.attempt_delivery(notification).await)
    }
}
