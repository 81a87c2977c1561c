//! Runner configuration.
//!
//! This module provides configuration for the evaluation runner: connection
//! URLs, worker pool sizing, provider timeouts and retry policy, and the
//! multi-step generation budget.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the evaluation runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    // Transport settings
    /// Redis connection URL for the task queue.
    pub redis_url: String,
    /// Name of the task queue (used as prefix for Redis keys).
    pub queue_name: String,
    /// PostgreSQL database connection URL.
    pub database_url: String,

    // Worker pool settings
    /// Number of concurrent workers.
    pub num_workers: usize,
    /// How long a worker blocks on an empty queue before re-checking shutdown.
    pub poll_interval: Duration,
    /// Timeout for graceful pool shutdown.
    pub shutdown_timeout: Duration,

    // Generation provider settings
    /// Wall-clock timeout for a single provider HTTP call.
    pub provider_timeout: Duration,
    /// Total attempts for a transient provider failure.
    pub provider_attempts: u32,
    /// Fixed delay between provider retry attempts.
    pub provider_retry_delay: Duration,
    /// Maximum rounds of the multi-step tool-calling loop.
    pub max_agent_steps: usize,

    // Tool bridge settings
    /// Base URL of the tool bridge; tools are disabled when unset.
    pub tool_bridge_url: Option<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "evalforge:tasks".to_string(),
            database_url: "postgres://localhost/evalforge".to_string(),
            num_workers: 4,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            provider_timeout: Duration::from_secs(120),
            provider_attempts: 3,
            provider_retry_delay: Duration::from_secs(2),
            max_agent_steps: 10,
            tool_bridge_url: None,
        }
    }
}

impl RunnerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from environment variables.
    ///
    /// Reads (all optional, defaults apply otherwise):
    /// - `EVALFORGE_REDIS_URL`
    /// - `EVALFORGE_QUEUE`
    /// - `EVALFORGE_DATABASE_URL`
    /// - `EVALFORGE_WORKERS`
    /// - `EVALFORGE_MAX_STEPS`
    /// - `EVALFORGE_TOOL_BRIDGE_URL`
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("EVALFORGE_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(name) = std::env::var("EVALFORGE_QUEUE") {
            config.queue_name = name;
        }
        if let Ok(url) = std::env::var("EVALFORGE_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(workers) = std::env::var("EVALFORGE_WORKERS") {
            config.num_workers =
                workers
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "EVALFORGE_WORKERS".to_string(),
                        message: format!("{}", e),
                    })?;
        }
        if let Ok(steps) = std::env::var("EVALFORGE_MAX_STEPS") {
            config.max_agent_steps =
                steps
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue {
                        key: "EVALFORGE_MAX_STEPS".to_string(),
                        message: format!("{}", e),
                    })?;
        }
        if let Ok(url) = std::env::var("EVALFORGE_TOOL_BRIDGE_URL") {
            config.tool_bridge_url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the queue name.
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Sets the database URL.
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    /// Sets the number of workers.
    pub fn with_num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the maximum rounds of the tool-calling loop.
    pub fn with_max_agent_steps(mut self, steps: usize) -> Self {
        self.max_agent_steps = steps;
        self
    }

    /// Sets the tool bridge URL.
    pub fn with_tool_bridge_url(mut self, url: impl Into<String>) -> Self {
        self.tool_bridge_url = Some(url.into());
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "num_workers must be at least 1".to_string(),
            ));
        }
        if self.max_agent_steps == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_agent_steps must be at least 1".to_string(),
            ));
        }
        if self.provider_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "provider_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RunnerConfig::default();

        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.queue_name, "evalforge:tasks");
        assert_eq!(config.num_workers, 4);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.provider_attempts, 3);
        assert_eq!(config.max_agent_steps, 10);
        assert!(config.tool_bridge_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RunnerConfig::new()
            .with_redis_url("redis://custom:6380")
            .with_queue_name("my_queue")
            .with_database_url("postgres://db/eval")
            .with_num_workers(8)
            .with_poll_interval(Duration::from_secs(5))
            .with_max_agent_steps(3)
            .with_tool_bridge_url("http://bridge:8000");

        assert_eq!(config.redis_url, "redis://custom:6380");
        assert_eq!(config.queue_name, "my_queue");
        assert_eq!(config.database_url, "postgres://db/eval");
        assert_eq!(config.num_workers, 8);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.max_agent_steps, 3);
        assert_eq!(
            config.tool_bridge_url,
            Some("http://bridge:8000".to_string())
        );
    }

    #[test]
    fn test_config_validation() {
        let config = RunnerConfig::new().with_num_workers(0);
        assert!(config.validate().is_err());

        let config = RunnerConfig::new().with_max_agent_steps(0);
        assert!(config.validate().is_err());
    }
}
