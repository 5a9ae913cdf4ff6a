//! Outbound transports. A transport moves an already-addressed message over
//! the wire; it knows nothing about users, retries, or notification state.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use herald_common::types::NotificationType;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Delivery rejected with status {status}")]
    Rejected { status: u16 },

    #[error("Transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(
        &self,
        channel: NotificationType,
        address: &str,
        message: &str,
    ) -> Result<(), TransportError>;

    fn name(&self) -> &'static str;
}

/// Transport that only logs the delivery. Used when no real endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(
        &self,
        channel: NotificationType,
        address: &str,
        message: &str,
    ) -> Result<(), TransportError> {
        tracing::info!(channel = %channel, to = %address, message = %message, "Delivered");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[derive(Debug, Serialize)]
struct WebhookEnvelope<'a> {
    channel: NotificationType,
    address: &'a str,
    message: &'a str,
}

/// Transport that POSTs each delivery as JSON to a gateway webhook.
/// Any non-2xx response counts as a failed delivery.
#[derive(Debug, Clone)]
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    async fn deliver(
        &self,
        channel: NotificationType,
        address: &str,
        message: &str,
    ) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookEnvelope {
                channel,
                address,
                message,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
            });
        }

        tracing::debug!(channel = %channel, status = status.as_u16(), "Webhook accepted delivery");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
