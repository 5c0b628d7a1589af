use std::time::Duration;

use verdant_pipeline::config::parse;
use verdant_pipeline::{ConfigError, PipelineConfig};

/// Worker process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this process on claimed jobs (default: `worker-<pid>`).
    pub worker_id: String,
    /// Jobs processed at once (default: `5`).
    pub concurrency: usize,
    /// Delay between claim attempts when idle (default: `500` ms).
    pub poll_interval: Duration,
    /// Stalled-job recovery and retention pruning period (default: `60` s).
    pub maintenance_interval: Duration,
    /// Connection pool size (default: `10`).
    pub database_max_connections: u32,
    pub pipeline: PipelineConfig,
}

impl WorkerConfig {
    /// | Env Var                     | Default        |
    /// |-----------------------------|----------------|
    /// | `WORKER_ID`                 | `worker-<pid>` |
    /// | `WORKER_CONCURRENCY`        | `5`            |
    /// | `WORKER_POLL_INTERVAL_MS`   | `500`          |
    /// | `WORKER_MAINTENANCE_SECS`   | `60`           |
    /// | `DATABASE_MAX_CONNECTIONS`  | `10`           |
    ///
    /// Pipeline settings are read by [`PipelineConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let concurrency: usize = parse(&lookup, "WORKER_CONCURRENCY", "usize", 5)?;
        Ok(Self {
            worker_id: lookup("WORKER_ID")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| format!("worker-{}", std::process::id())),
            concurrency: concurrency.max(1),
            poll_interval: Duration::from_millis(parse(
                &lookup,
                "WORKER_POLL_INTERVAL_MS",
                "u64",
                500,
            )?),
            maintenance_interval: Duration::from_secs(parse(
                &lookup,
                "WORKER_MAINTENANCE_SECS",
                "u64",
                60,
            )?),
            database_max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS", "u32", 10)?,
            pipeline: PipelineConfig::from_lookup(&lookup)?,
        })
    }
}
