//! Herald API server binary entrypoint.

use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use herald_common::config::AppConfig;
use herald_common::redis_pool::create_redis_pool;
use herald_common::store::connect_store;
use herald_notifier::queue::{QueueConfig, RedisJobQueue};

use herald_api::routes::create_router;
use herald_api::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("herald_api=debug,herald_common=info,tower_http=debug")
        }))
        .init();

    tracing::info!("Starting Herald API server...");

    let config = AppConfig::from_env()?;

    let store = connect_store(&config).await?;

    let redis = create_redis_pool(&config.redis_url).await?;
    tracing::info!("Redis connection established");

    let queue = RedisJobQueue::new(redis, QueueConfig::from_app_config(&config));
    queue.ensure_group().await?;

    let state = AppState::new(store, Arc::new(queue));

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.api_bind_addr.parse().map_err(|e| {
        anyhow::anyhow!("API_BIND_ADDR '{}' is not a valid address: {}", config.api_bind_addr, e)
    })?;
    tracing::info!("API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl+C, shutting down API server");
        })
        .await?;

    Ok(())
}
