//! Queue and processor settings.

use std::time::Duration;

use shopworks_core::{ConfigError, EnvLookup, ProcessEnv};

/// Settings for [`crate::PriorityTaskQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueueConfig {
    /// Bound of each priority lane.
    pub lane_capacity: usize,
    /// How long an idle `dequeue` waits before re-checking the lanes.
    pub poll_interval: Duration,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            lane_capacity: 1000,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl TaskQueueConfig {
    pub fn with_lane_capacity(mut self, capacity: usize) -> Self {
        self.lane_capacity = capacity;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    /// `SHOPWORKS_TASK_LANE_CAPACITY`, `SHOPWORKS_TASK_POLL_INTERVAL_MS`.
    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            lane_capacity: env
                .parse("SHOPWORKS_TASK_LANE_CAPACITY")?
                .unwrap_or(defaults.lane_capacity),
            poll_interval: env
                .millis("SHOPWORKS_TASK_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lane_capacity == 0 {
            return Err(ConfigError::invalid(
                "SHOPWORKS_TASK_LANE_CAPACITY",
                self.lane_capacity,
                "lane capacity must be at least 1",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                "SHOPWORKS_TASK_POLL_INTERVAL_MS",
                0,
                "poll interval must be positive",
            ));
        }
        Ok(())
    }
}

/// Settings for [`crate::TaskProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskProcessorConfig {
    /// Name for logging.
    pub name: String,
}

impl Default for TaskProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
        }
    }
}

impl TaskProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    /// `SHOPWORKS_TASK_PROCESSOR_NAME`.
    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            name: env
                .parse("SHOPWORKS_TASK_PROCESSOR_NAME")?
                .unwrap_or(defaults.name),
        })
    }
}
