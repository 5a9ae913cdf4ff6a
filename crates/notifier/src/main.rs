//! Herald delivery worker binary entrypoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::redis_pool::create_redis_pool;
use herald_common::store::connect_store;

use herald_notifier::directory::StaticDirectory;
use herald_notifier::policy::RetryPolicy;
use herald_notifier::queue::{QueueConfig, RedisJobQueue};
use herald_notifier::sender::SenderRegistry;
use herald_notifier::transport::{LogTransport, Transport, WebhookTransport};
use herald_notifier::worker::{DeliveryWorker, RunConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_common=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald delivery worker starting...");

    // Load configuration
    let config = AppConfig::from_env()?;

    let store = connect_store(&config).await?;

    let directory = match &config.recipient_directory_path {
        Some(path) => StaticDirectory::from_file(path)?,
        None => StaticDirectory::seeded(),
    };

    let transport: Arc<dyn Transport> = match &config.delivery_webhook_url {
        Some(url) => Arc::new(WebhookTransport::new(
            url.clone(),
            Duration::from_millis(config.delivery_timeout_ms),
        )?),
        None => {
            tracing::warn!("DELIVERY_WEBHOOK_URL not set, deliveries will only be logged");
            Arc::new(LogTransport)
        }
    };

    let senders = SenderRegistry::standard(Arc::new(directory), transport);
    let worker = Arc::new(DeliveryWorker::new(
        store,
        senders,
        RetryPolicy::new(config.worker_max_attempts),
    ));

    // Settlements and the blocking read each get their own connection.
    let redis = create_redis_pool(&config.redis_url).await?;
    let reader = create_redis_pool(&config.redis_url).await?;
    let queue = Arc::new(
        RedisJobQueue::new(redis, QueueConfig::from_app_config(&config)).with_reader(reader),
    );
    queue.ensure_group().await?;

    tracing::info!(
        stream = %queue.config().stream,
        group = %queue.config().group,
        consumer = %queue.config().consumer,
        "Joined job queue"
    );

    // Flip the shutdown flag on Ctrl+C; the worker drains in-flight jobs.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal, stopping gracefully...");
            let _ = shutdown_tx.send(true);
        }
    });

    worker
        .run(queue, RunConfig::from_app_config(&config), shutdown_rx)
        .await?;

    tracing::info!("Herald delivery worker stopped.");
    Ok(())
}
