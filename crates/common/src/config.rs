use std::str::FromStr;

use serde::Deserialize;
use uuid::Uuid;

/// Which notification store implementation the binaries should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    /// In-process store. Records do not survive a restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(anyhow::anyhow!(
                "STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
                other
            )),
        }
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Store implementation (default: postgres)
    pub store_backend: StoreBackend,

    /// PostgreSQL connection string, required for the postgres backend
    pub database_url: Option<String>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,

    /// Redis connection string
    pub redis_url: String,

    /// API listen address (default: 0.0.0.0:3000)
    pub api_bind_addr: String,

    /// Redis stream carrying delivery jobs
    pub job_stream: String,

    /// Consumer group shared by all delivery workers
    pub job_consumer_group: String,

    /// Stream receiving messages rejected without requeue
    pub job_dead_letter_stream: String,

    /// Consumer name of this worker inside the group (default: random per process)
    pub worker_consumer_name: String,

    /// Maximum number of in-flight deliveries per worker (default: 10)
    pub worker_prefetch: usize,

    /// Total delivery attempts before a notification is marked failed (default: 3)
    pub worker_max_attempts: u32,

    /// How long a read blocks waiting for new jobs, in milliseconds (default: 5000)
    pub worker_block_ms: u64,

    /// Idle time after which another consumer's unacknowledged job is claimed (default: 60000)
    pub worker_claim_idle_ms: u64,

    /// How long shutdown waits for in-flight deliveries, in seconds (default: 30)
    pub worker_shutdown_grace_secs: u64,

    /// JSON file with recipient contact entries; the built-in directory is used when unset
    pub recipient_directory_path: Option<String>,

    /// Webhook receiving delivery requests; deliveries are only logged when unset
    pub delivery_webhook_url: Option<String>,

    /// Timeout for a single webhook delivery in milliseconds (default: 5000)
    pub delivery_timeout_ms: u64,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let store_backend: StoreBackend = env_or("STORE_BACKEND", "postgres")?;
        let database_url = std::env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            return Err(anyhow::anyhow!(
                "DATABASE_URL environment variable is required for the postgres store"
            ));
        }

        Ok(Self {
            store_backend,
            database_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", "20")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            api_bind_addr: std::env::var("API_BIND_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            job_stream: std::env::var("JOB_STREAM")
                .unwrap_or_else(|_| "notifications:jobs".to_string()),
            job_consumer_group: std::env::var("JOB_CONSUMER_GROUP")
                .unwrap_or_else(|_| "notifiers".to_string()),
            job_dead_letter_stream: std::env::var("JOB_DEAD_LETTER_STREAM")
                .unwrap_or_else(|_| "notifications:dead".to_string()),
            worker_consumer_name: std::env::var("WORKER_CONSUMER_NAME")
                .unwrap_or_else(|_| format!("notifier-{}", Uuid::new_v4().simple())),
            worker_prefetch: env_or("WORKER_PREFETCH", "10")?,
            worker_max_attempts: env_or("WORKER_MAX_ATTEMPTS", "3")?,
            worker_block_ms: env_or("WORKER_BLOCK_MS", "5000")?,
            worker_claim_idle_ms: env_or("WORKER_CLAIM_IDLE_MS", "60000")?,
            worker_shutdown_grace_secs: env_or("WORKER_SHUTDOWN_GRACE_SECS", "30")?,
            recipient_directory_path: std::env::var("RECIPIENT_DIRECTORY_PATH").ok(),
            delivery_webhook_url: std::env::var("DELIVERY_WEBHOOK_URL").ok(),
            delivery_timeout_ms: env_or("DELIVERY_TIMEOUT_MS", "5000")?,
        }
        .validated()?)
    }

    fn validated(self) -> anyhow::Result<Self> {
        if self.worker_prefetch == 0 {
            return Err(anyhow::anyhow!("WORKER_PREFETCH must be at least 1"));
        }
        if self.worker_max_attempts == 0 {
            return Err(anyhow::anyhow!("WORKER_MAX_ATTEMPTS must be at least 1"));
        }
        // BLOCK 0 means wait forever in Redis.
        if self.worker_block_ms == 0 {
            return Err(anyhow::anyhow!("WORKER_BLOCK_MS must be at least 1"));
        }
        Ok(self)
    }
}

/// Read `key`, falling back to `default`, and parse it.
fn env_or<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    parse_value(key, &raw)
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> anyhow::Result<T> {
    raw.trim().parse().map_err(|_| {
        anyhow::anyhow!(
            "{} must be a valid {}, got '{}'",
            key,
            std::any::type_name::<T>(),
            raw
        )
    })
}
