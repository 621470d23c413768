//! Worker process configuration.

use crate::worker::{
    DEFAULT_BACKOFF_BASE_MS, DEFAULT_LEASE_MS, DEFAULT_MAX_ATTEMPTS, WorkerOptions,
};

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Number of worker loops to run in this process
    pub worker_count: usize,

    /// Per-worker scheduling tunables
    pub worker: WorkerOptions,
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|text| text.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let worker_count = env_parse("BELAY_WORKER_COUNT", 4);
        let worker = WorkerOptions {
            lease_ms: env_parse("BELAY_LEASE_MS", DEFAULT_LEASE_MS),
            max_attempts: env_parse("BELAY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
            backoff_base_ms: env_parse("BELAY_BACKOFF_BASE_MS", DEFAULT_BACKOFF_BASE_MS),
        };

        Ok(Config {
            database_url,
            worker_count,
            worker,
        })
    }
}
