//! Outbox dispatcher settings.

use std::str::FromStr;
use std::time::Duration;

use shopworks_core::{ConfigError, EnvLookup, ProcessEnv};

/// Transport used by the dispatch workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// HTTP POST to the message type's destination.
    #[default]
    Webhook,
    /// Write the message to the log and report success.
    Log,
}

impl DispatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchMode::Webhook => "webhook",
            DispatchMode::Log => "log",
        }
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webhook" => Ok(Self::Webhook),
            "log" => Ok(Self::Log),
            other => Err(format!("expected webhook or log, got {other}")),
        }
    }
}

/// Dispatch loop and reaper settings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// Claims allowed before a message is dead-lettered.
    pub max_attempts: u32,
    /// Base idle poll delay.
    pub poll_interval: Duration,
    /// Cap for the idle backoff.
    pub max_idle_interval: Duration,
    /// Fraction of the idle delay added at random, in `[0, 1]`.
    pub jitter: f64,
    /// Bounds of the randomized pause after a failed dispatch.
    pub failure_delay_min: Duration,
    pub failure_delay_max: Duration,
    /// Pause when the outbox table does not exist yet.
    pub schema_missing_backoff: Duration,
    pub mode: DispatchMode,
    pub content_type: String,
    /// Age after which a `Processing` row is considered abandoned.
    pub claim_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            poll_interval: Duration::from_secs(3),
            max_idle_interval: Duration::from_secs(60),
            jitter: 0.25,
            failure_delay_min: Duration::from_millis(100),
            failure_delay_max: Duration::from_millis(300),
            schema_missing_backoff: Duration::from_secs(30),
            mode: DispatchMode::Webhook,
            content_type: "application/json".to_string(),
            claim_timeout: Duration::from_secs(5 * 60),
            reap_interval: Duration::from_secs(60),
        }
    }
}

impl OutboxConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_poll_interval(mut self, base: Duration, max_idle: Duration) -> Self {
        self.poll_interval = base;
        self.max_idle_interval = max_idle;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_failure_delay(mut self, min: Duration, max: Duration) -> Self {
        self.failure_delay_min = min;
        self.failure_delay_max = max;
        self
    }

    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> Self {
        self.claim_timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, ConfigError> {
        let d = Self::default();
        let config = Self {
            max_attempts: env.parse("SHOPWORKS_OUTBOX_MAX_ATTEMPTS")?.unwrap_or(d.max_attempts),
            poll_interval: env.millis("SHOPWORKS_OUTBOX_POLL_INTERVAL_MS")?.unwrap_or(d.poll_interval),
            max_idle_interval: env
                .millis("SHOPWORKS_OUTBOX_MAX_IDLE_INTERVAL_MS")?
                .unwrap_or(d.max_idle_interval),
            jitter: env.parse("SHOPWORKS_OUTBOX_JITTER")?.unwrap_or(d.jitter),
            failure_delay_min: env
                .millis("SHOPWORKS_OUTBOX_FAILURE_DELAY_MIN_MS")?
                .unwrap_or(d.failure_delay_min),
            failure_delay_max: env
                .millis("SHOPWORKS_OUTBOX_FAILURE_DELAY_MAX_MS")?
                .unwrap_or(d.failure_delay_max),
            schema_missing_backoff: env
                .millis("SHOPWORKS_OUTBOX_SCHEMA_MISSING_BACKOFF_MS")?
                .unwrap_or(d.schema_missing_backoff),
            mode: env.parse("SHOPWORKS_OUTBOX_MODE")?.unwrap_or(d.mode),
            content_type: env
                .get("SHOPWORKS_OUTBOX_CONTENT_TYPE")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(d.content_type),
            claim_timeout: env
                .secs("SHOPWORKS_OUTBOX_CLAIM_TIMEOUT_SECS")?
                .unwrap_or(d.claim_timeout),
            reap_interval: env
                .secs("SHOPWORKS_OUTBOX_REAP_INTERVAL_SECS")?
                .unwrap_or(d.reap_interval),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "SHOPWORKS_OUTBOX_MAX_ATTEMPTS",
                self.max_attempts,
                "at least one attempt is required",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::invalid(
                "SHOPWORKS_OUTBOX_POLL_INTERVAL_MS",
                0,
                "poll interval must be positive",
            ));
        }
        if self.max_idle_interval < self.poll_interval {
            return Err(ConfigError::invalid(
                "SHOPWORKS_OUTBOX_MAX_IDLE_INTERVAL_MS",
                self.max_idle_interval.as_millis(),
                "must not be shorter than the poll interval",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::invalid(
                "SHOPWORKS_OUTBOX_JITTER",
                self.jitter,
                "jitter must be within [0, 1]",
            ));
        }
        if self.failure_delay_min > self.failure_delay_max {
            return Err(ConfigError::invalid(
                "SHOPWORKS_OUTBOX_FAILURE_DELAY_MIN_MS",
                self.failure_delay_min.as_millis(),
                "must not exceed the maximum failure delay",
            ));
        }
        if self.claim_timeout.is_zero() || self.reap_interval.is_zero() {
            return Err(ConfigError::invalid(
                "SHOPWORKS_OUTBOX_CLAIM_TIMEOUT_SECS",
                self.claim_timeout.as_secs(),
                "claim timeout and reap interval must be positive",
            ));
        }
        Ok(())
    }
}

/// HTTP transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    /// Prefix for destinations that are not absolute URLs.
    pub base_url: Option<String>,
    pub timeout: Duration,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Duration::from_secs(10),
        }
    }
}

impl WebhookConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&ProcessEnv)
    }

    pub fn from_lookup(env: &impl EnvLookup) -> Result<Self, ConfigError> {
        let d = Self::default();
        let base_url = env.get("SHOPWORKS_WEBHOOK_BASE_URL").filter(|v| !v.trim().is_empty());
        if let Some(url) = &base_url {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| ConfigError::invalid("SHOPWORKS_WEBHOOK_BASE_URL", url, e.to_string()))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ConfigError::invalid(
                    "SHOPWORKS_WEBHOOK_BASE_URL",
                    url,
                    "scheme must be http or https",
                ));
            }
        }
        Ok(Self {
            base_url,
            timeout: env.millis("SHOPWORKS_WEBHOOK_TIMEOUT_MS")?.unwrap_or(d.timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = OutboxConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.max_idle_interval, Duration::from_secs(60));
        assert_eq!(config.jitter, 0.25);
        assert_eq!(config.schema_missing_backoff, Duration::from_secs(30));
        assert_eq!(config.mode, DispatchMode::Webhook);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn reads_overrides_from_lookup() {
        let env = HashMap::from([
            ("SHOPWORKS_OUTBOX_MAX_ATTEMPTS", "3"),
            ("SHOPWORKS_OUTBOX_POLL_INTERVAL_MS", "500"),
            ("SHOPWORKS_OUTBOX_MODE", "LOG"),
            ("SHOPWORKS_OUTBOX_JITTER", "0"),
        ]);
        let config = OutboxConfig::from_lookup(&env).unwrap();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.mode, DispatchMode::Log);
        assert_eq!(config.jitter, 0.0);
    }

    #[test]
    fn rejects_out_of_range_jitter() {
        let env = HashMap::from([("SHOPWORKS_OUTBOX_JITTER", "1.5")]);
        let err = OutboxConfig::from_lookup(&env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "SHOPWORKS_OUTBOX_JITTER"));
    }

    #[test]
    fn rejects_idle_cap_below_poll_interval() {
        let env = HashMap::from([
            ("SHOPWORKS_OUTBOX_POLL_INTERVAL_MS", "5000"),
            ("SHOPWORKS_OUTBOX_MAX_IDLE_INTERVAL_MS", "1000"),
        ]);
        assert!(OutboxConfig::from_lookup(&env).is_err());
    }

    #[test]
    fn unknown_mode_is_an_error() {
        let env = HashMap::from([("SHOPWORKS_OUTBOX_MODE", "kafka")]);
        assert!(OutboxConfig::from_lookup(&env).is_err());
    }

    #[test]
    fn webhook_base_url_must_be_http() {
        let env = HashMap::from([("SHOPWORKS_WEBHOOK_BASE_URL", "ftp://hooks.internal")]);
        assert!(WebhookConfig::from_lookup(&env).is_err());

        let env = HashMap::from([
            ("SHOPWORKS_WEBHOOK_BASE_URL", "https://hooks.internal/events"),
            ("SHOPWORKS_WEBHOOK_TIMEOUT_MS", "2500"),
        ]);
        let config = WebhookConfig::from_lookup(&env).unwrap();
        assert_eq!(config.base_url.as_deref(), Some("https://hooks.internal/events"));
        assert_eq!(config.timeout, Duration::from_millis(2500));
    }
}
