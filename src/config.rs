//! Scheduler configuration.
//!
//! Everything is read from environment variables; only `DATABASE_URL` is
//! required. Without `REDIS_URL` the scheduler falls back to the in-memory
//! result cache and dispatch queue, which is fine for a single process.

use std::time::Duration;

use thiserror::Error;

use crate::execution::{AnalysisVolumes, RunnerConfig, DEFAULT_ANALYSIS_IMAGE};
use crate::scheduler::task::{TaskOptions, DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT_MINUTES};

/// Longest accepted value for any duration setting (100 years).
pub const MAX_DURATION_SETTING: Duration = Duration::from_secs(100 * 365 * 86_400);

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration of a scheduler process.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    // Backends
    /// `sqlite://...` or `postgres://...`.
    pub database_url: String,
    /// Redis for the result cache and dispatch queue, when set.
    pub redis_url: Option<String>,
    /// Key prefix of the Redis dispatch queue.
    pub queue_name: String,

    // Workers
    pub workers: usize,
    pub poll_interval: Duration,

    // Scheduling policy
    pub contention_delay: Duration,
    pub retry_base_delay: Duration,
    /// Time past due after which a retry without a queued job is re-submitted.
    pub retry_grace: Duration,
    pub max_retries: u32,
    pub timeout_minutes: u32,
    pub heartbeat_interval: Duration,
    pub stale_heartbeat: Duration,

    // Periodic jobs
    pub sweep_interval: Duration,
    pub cleanup_interval: Duration,
    pub retention: Duration,

    pub cache_ttl: Duration,
    /// Base of report download links.
    pub base_url: Option<String>,

    // Analysis runner
    pub analysis_image: String,
    pub volumes: AnalysisVolumes,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: None,
            queue_name: "analysis".to_string(),
            workers: 2,
            poll_interval: Duration::from_secs(1),
            contention_delay: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(60),
            retry_grace: Duration::from_secs(300),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            heartbeat_interval: Duration::from_secs(30),
            stale_heartbeat: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            cache_ttl: Duration::from_secs(604_800),
            base_url: None,
            analysis_image: DEFAULT_ANALYSIS_IMAGE.to_string(),
            volumes: AnalysisVolumes::default(),
        }
    }
}

impl SchedulerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.database_url = lookup("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        config.redis_url = lookup("REDIS_URL").filter(|v| !v.is_empty());

        if let Some(val) = lookup("SCHEDULER_QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Some(val) = lookup("SCHEDULER_WORKERS") {
            config.workers = parse_env_value(&val, "SCHEDULER_WORKERS")?;
        }

        let secs = |key: &str, current: Duration| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(val) => Ok(Duration::from_secs(parse_env_value(&val, key)?)),
                None => Ok(current),
            }
        };

        config.poll_interval = secs("SCHEDULER_POLL_INTERVAL_SECS", config.poll_interval)?;
        config.contention_delay = secs("SCHEDULER_CONTENTION_DELAY_SECS", config.contention_delay)?;
        config.retry_base_delay = secs("SCHEDULER_RETRY_BASE_DELAY_SECS", config.retry_base_delay)?;
        config.retry_grace = secs("SCHEDULER_RETRY_GRACE_SECS", config.retry_grace)?;
        config.heartbeat_interval =
            secs("SCHEDULER_HEARTBEAT_INTERVAL_SECS", config.heartbeat_interval)?;
        config.stale_heartbeat = secs("SCHEDULER_STALE_HEARTBEAT_SECS", config.stale_heartbeat)?;
        config.sweep_interval = secs("SCHEDULER_SWEEP_INTERVAL_SECS", config.sweep_interval)?;
        config.cleanup_interval = secs("SCHEDULER_CLEANUP_INTERVAL_SECS", config.cleanup_interval)?;
        config.cache_ttl = secs("SCHEDULER_CACHE_TTL_SECS", config.cache_ttl)?;

        if let Some(val) = lookup("SCHEDULER_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "SCHEDULER_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("SCHEDULER_TIMEOUT_MINUTES") {
            config.timeout_minutes = parse_env_value(&val, "SCHEDULER_TIMEOUT_MINUTES")?;
        }

        if let Some(val) = lookup("SCHEDULER_RETENTION_DAYS") {
            let days: u64 = parse_env_value(&val, "SCHEDULER_RETENTION_DAYS")?;
            let secs = days
                .checked_mul(SECS_PER_DAY)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "SCHEDULER_RETENTION_DAYS".to_string(),
                    message: format!("{days} days is out of range"),
                })?;
            config.retention = Duration::from_secs(secs);
        }

        config.base_url = lookup("BASE_URL").filter(|v| !v.is_empty());

        if let Some(val) = lookup("ANALYSIS_IMAGE") {
            config.analysis_image = val;
        }

        let volumes = &mut config.volumes;
        for (key, slot) in [
            ("RESULTS_VOLUME", &mut volumes.results),
            ("STATIC_RESULTS_VOLUME", &mut volumes.static_results),
            ("FILE_WRITE_RESULTS_VOLUME", &mut volumes.file_write_results),
            ("ANALYZED_PACKAGES_VOLUME", &mut volumes.analyzed_packages),
            ("LOGS_VOLUME", &mut volumes.logs),
            ("STRACE_LOGS_VOLUME", &mut volumes.strace_logs),
            ("CONTAINER_VOLUME", &mut volumes.container_data),
        ] {
            if let Some(val) = lookup(key) {
                *slot = val;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.database_url.starts_with("sqlite:")
            || self.database_url.starts_with("postgres://")
            || self.database_url.starts_with("postgresql://"))
        {
            return Err(ConfigError::ValidationFailed(
                "database_url must be a sqlite: or postgres:// URL".to_string(),
            ));
        }

        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }

        if self.timeout_minutes == 0 {
            return Err(ConfigError::ValidationFailed(
                "timeout_minutes must be greater than 0".to_string(),
            ));
        }

        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("sweep_interval", self.sweep_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("cache_ttl", self.cache_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("contention_delay", self.contention_delay),
            ("retry_base_delay", self.retry_base_delay),
            ("retry_grace", self.retry_grace),
            ("heartbeat_interval", self.heartbeat_interval),
            ("stale_heartbeat", self.stale_heartbeat),
            ("sweep_interval", self.sweep_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("cache_ttl", self.cache_ttl),
            ("retention", self.retention),
        ] {
            if value > MAX_DURATION_SETTING {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} must not exceed {} days",
                    MAX_DURATION_SETTING.as_secs() / SECS_PER_DAY
                )));
            }
        }

        if self.queue_name.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name cannot be empty".to_string(),
            ));
        }

        if self.analysis_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "analysis_image cannot be empty".to_string(),
            ));
        }

        if self.volumes.names().iter().any(|name| name.is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "volume names cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Builder method to set the worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Options given to tasks enqueued without explicit overrides.
    pub fn task_defaults(&self) -> TaskOptions {
        TaskOptions::default()
            .with_max_retries(self.max_retries)
            .with_timeout_minutes(self.timeout_minutes)
    }

    /// Settings of the Docker analysis runner.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            image: self.analysis_image.clone(),
            volumes: self.volumes.clone(),
            ..RunnerConfig::default()
        }
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<SchedulerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SchedulerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("DATABASE_URL", "sqlite://scheduler.db")]).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_name, "analysis");
        assert_eq!(config.contention_delay, Duration::from_secs(30));
        assert_eq!(config.retry_base_delay, Duration::from_secs(60));
        assert_eq!(config.retry_grace, Duration::from_secs(300));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.timeout_minutes, 30);
        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.cleanup_interval, Duration::from_secs(3600));
        assert_eq!(config.retention, Duration::from_secs(7 * 86_400));
        assert_eq!(config.cache_ttl, Duration::from_secs(604_800));
        assert_eq!(config.analysis_image, DEFAULT_ANALYSIS_IMAGE);
        assert!(config.redis_url.is_none());
        assert!(config.base_url.is_none());
    }

    #[test]
    fn test_database_url_required() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "DATABASE_URL"));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db/packamal"),
            ("REDIS_URL", "redis://cache:6379"),
            ("SCHEDULER_WORKERS", "4"),
            ("SCHEDULER_MAX_RETRIES", "3"),
            ("SCHEDULER_RETENTION_DAYS", "14"),
            ("SCHEDULER_CACHE_TTL_SECS", "60"),
            ("BASE_URL", "https://packamal.example"),
            ("RESULTS_VOLUME", "custom_results"),
        ])
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retention, Duration::from_secs(14 * 86_400));
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.base_url.as_deref(), Some("https://packamal.example"));
        assert_eq!(config.volumes.results, "custom_results");
        assert_eq!(config.task_defaults().max_retries, 3);
        assert_eq!(config.runner_config().volumes.results, "custom_results");
    }

    #[test]
    fn test_invalid_number() {
        let err = load(&[
            ("DATABASE_URL", "sqlite://x.db"),
            ("SCHEDULER_WORKERS", "many"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SCHEDULER_WORKERS"));
    }

    #[test]
    fn test_huge_durations_are_rejected() {
        let err = load(&[
            ("DATABASE_URL", "sqlite://x.db"),
            ("SCHEDULER_RETENTION_DAYS", "300000000000000"),
        ])
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "SCHEDULER_RETENTION_DAYS")
        );

        let err = load(&[
            ("DATABASE_URL", "sqlite://x.db"),
            ("SCHEDULER_RETENTION_DAYS", "40000"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("retention"));

        let err = load(&[
            ("DATABASE_URL", "sqlite://x.db"),
            ("SCHEDULER_CACHE_TTL_SECS", "18446744073709551615"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("cache_ttl"));

        assert!(load(&[
            ("DATABASE_URL", "sqlite://x.db"),
            ("SCHEDULER_RETENTION_DAYS", "3650"),
        ])
        .is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(load(&[("DATABASE_URL", "mysql://nope")]).is_err());
        assert!(load(&[
            ("DATABASE_URL", "sqlite://x.db"),
            ("SCHEDULER_TIMEOUT_MINUTES", "0")
        ])
        .is_err());
        assert!(SchedulerConfig::default()
            .with_database_url("sqlite://x.db")
            .with_workers(0)
            .validate()
            .is_err());
    }
}
