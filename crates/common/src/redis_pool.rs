use redis::Client;
use redis::aio::ConnectionManager;

/// Create a Redis connection manager and verify the server answers.
///
/// The manager reconnects on its own after a dropped connection, so one
/// instance is cloned into every task that talks to the job queue.
pub async fn create_redis_pool(redis_url: &str) -> anyhow::Result<ConnectionManager> {
    let client = Client::open(redis_url)?;
    let mut manager = ConnectionManager::new(client).await?;

    let pong: String = redis::cmd("PING").query_async(&mut manager).await?;
    tracing::info!(reply = %pong, "Connected to Redis");
    Ok(manager)
}
