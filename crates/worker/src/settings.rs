//! Process-level settings for the worker binary.

use std::net::SocketAddr;
use std::time::Duration;

use shopworks_core::{ConfigError, EnvLookup, ProcessEnv};
use shopworks_outbox::{OutboxConfig, WebhookConfig};
use shopworks_tasks::{TaskProcessorConfig, TaskQueueConfig};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub database_url: String,
    pub max_connections: u32,
    /// Create the outbox table on startup when it is missing.
    pub bootstrap_schema: bool,
    /// Number of concurrent outbox dispatch loops.
    pub outbox_workers: usize,
    /// How often the stats task is enqueued.
    pub stats_interval: Duration,
    /// Prometheus scrape address; unset disables the exporter.
    pub metrics_listen: Option<SocketAddr>,
    pub outbox: OutboxConfig,
    pub webhook: WebhookConfig,
    pub queue: TaskQueueConfig,
    pub processor: TaskProcessorConfig,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, ConfigError> {
        let settings = Self {
            database_url: env.required("DATABASE_URL")?,
            max_connections: env.parse("SHOPWORKS_DB_MAX_CONNECTIONS")?.unwrap_or(10),
            bootstrap_schema: env.parse("SHOPWORKS_BOOTSTRAP_SCHEMA")?.unwrap_or(true),
            outbox_workers: env.parse("SHOPWORKS_OUTBOX_WORKERS")?.unwrap_or(1),
            stats_interval: env
                .secs("SHOPWORKS_STATS_INTERVAL_SECS")?
                .unwrap_or(Duration::from_secs(60)),
            metrics_listen: env.parse("SHOPWORKS_METRICS_LISTEN")?,
            outbox: OutboxConfig::from_lookup(env)?,
            webhook: WebhookConfig::from_lookup(env)?,
            queue: TaskQueueConfig::from_lookup(env)?,
            processor: TaskProcessorConfig::from_lookup(env)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.outbox_workers == 0 {
            return Err(ConfigError::invalid("SHOPWORKS_OUTBOX_WORKERS", 0, "must be at least 1"));
        }
        let workers = u32::try_from(self.outbox_workers).map_err(|_| {
            ConfigError::invalid("SHOPWORKS_OUTBOX_WORKERS", self.outbox_workers, "too many workers")
        })?;
        if self.max_connections < workers {
            return Err(ConfigError::invalid(
                "SHOPWORKS_DB_MAX_CONNECTIONS",
                self.max_connections,
                "must cover one connection per outbox worker",
            ));
        }
        if self.stats_interval.is_zero() {
            return Err(ConfigError::invalid("SHOPWORKS_STATS_INTERVAL_SECS", 0, "must be positive"));
        }
        Ok(())
    }
}
