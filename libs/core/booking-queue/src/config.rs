//! Queue and worker configuration
//!
//! This module provides `QueueConfig` for configuring the queue client,
//! the worker loop and the supervisor.

use core_config::{env_or_default, env_parse, ConfigError, FromEnv};
use std::time::Duration;

/// Receive limit of managed FIFO queues per call.
pub const MAX_RECEIVE_BATCH: usize = 10;

/// Longest visibility timeout a managed queue accepts (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 43_200;

/// Configuration for the booking queue and its workers
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Queue identifier (managed queue URL); empty selects the local queue
    pub queue_url: String,

    /// Cloud region of the managed queue
    pub region: String,

    /// How long a received message stays hidden from other consumers
    pub visibility_timeout_seconds: u64,

    /// Maximum messages per receive call (capped at 10)
    pub batch_size: usize,

    /// Deliveries allowed before a message is dead-lettered
    pub max_receive_count: u32,

    /// Long-poll duration of a receive call
    pub poll_wait_seconds: u64,

    /// Number of concurrent workers
    pub worker_count: usize,

    /// First backoff after an empty receive
    pub empty_backoff_initial_ms: u64,

    /// Upper bound of the empty-receive backoff
    pub empty_backoff_max_ms: u64,

    /// Return retryable failures to the queue immediately instead of waiting out the lease
    pub nack_on_retryable: bool,

    /// First pause after a batch that failed only because the store was down
    pub store_backoff_initial_ms: u64,

    /// Upper bound of the store-outage backoff
    pub store_backoff_max_ms: u64,

    /// Grace period for draining workers on shutdown
    pub shutdown_timeout_seconds: u64,

    /// Window in which the local queue suppresses repeated dedup ids
    pub dedup_window_seconds: u64,
}

impl QueueConfig {
    /// Create a configuration with defaults for the given queue
    pub fn new(queue_url: impl Into<String>) -> Self {
        Self {
            queue_url: queue_url.into(),
            region: "eu-north-1".to_string(),
            visibility_timeout_seconds: 30,
            batch_size: MAX_RECEIVE_BATCH,
            max_receive_count: 3,
            poll_wait_seconds: 20,
            worker_count: 5,
            empty_backoff_initial_ms: 1000,
            empty_backoff_max_ms: 30_000,
            nack_on_retryable: false,
            store_backoff_initial_ms: 1000,
            store_backoff_max_ms: 30_000,
            shutdown_timeout_seconds: 30,
            dedup_window_seconds: 300,
        }
    }

    /// Configuration for the in-process queue
    pub fn local() -> Self {
        Self::new("")
    }

    /// Whether a managed queue is configured
    pub fn uses_managed_queue(&self) -> bool {
        !self.queue_url.trim().is_empty()
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_seconds)
    }

    /// Interval at which an in-flight batch renews its visibility lease
    pub fn visibility_extend_interval(&self) -> Duration {
        Duration::from_millis((self.visibility_timeout_seconds.saturating_mul(1000) / 2).max(100))
    }

    /// Set the region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Set the visibility timeout
    pub fn with_visibility_timeout_seconds(mut self, seconds: u64) -> Self {
        self.visibility_timeout_seconds = seconds;
        self
    }

    /// Set the batch size (clamped to 1..=10)
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.clamp(1, MAX_RECEIVE_BATCH);
        self
    }

    /// Set the max receive count
    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }

    /// Set the long-poll duration
    pub fn with_poll_wait_seconds(mut self, seconds: u64) -> Self {
        self.poll_wait_seconds = seconds;
        self
    }

    /// Set the number of workers
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the empty-receive backoff bounds
    pub fn with_empty_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.empty_backoff_initial_ms = initial;
        self.empty_backoff_max_ms = max.max(initial);
        self
    }

    /// Set the store-outage backoff bounds
    pub fn with_store_backoff_ms(mut self, initial: u64, max: u64) -> Self {
        self.store_backoff_initial_ms = initial;
        self.store_backoff_max_ms = max.max(initial);
        self
    }

    /// Enable or disable nacking retryable failures
    pub fn with_nack_on_retryable(mut self, enable: bool) -> Self {
        self.nack_on_retryable = enable;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_timeout_seconds(mut self, seconds: u64) -> Self {
        self.shutdown_timeout_seconds = seconds;
        self
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 || self.batch_size > MAX_RECEIVE_BATCH {
            return Err(ConfigError::invalid(
                "BOOKING_BATCH_SIZE",
                format!("must be between 1 and {MAX_RECEIVE_BATCH}"),
            ));
        }
        if self.visibility_timeout_seconds == 0
            || self.visibility_timeout_seconds > MAX_VISIBILITY_TIMEOUT_SECS
        {
            return Err(ConfigError::invalid(
                "BOOKING_VISIBILITY_TIMEOUT_SECS",
                format!("must be between 1 and {MAX_VISIBILITY_TIMEOUT_SECS}"),
            ));
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::invalid(
                "BOOKING_MAX_RECEIVE_COUNT",
                "must be greater than 0",
            ));
        }
        if self.worker_count == 0 {
            return Err(ConfigError::invalid(
                "BOOKING_WORKER_COUNT",
                "must be greater than 0",
            ));
        }
        // Managed queues cap long polling at 20 seconds
        if self.uses_managed_queue() && self.poll_wait_seconds > 20 {
            return Err(ConfigError::invalid(
                "BOOKING_POLL_WAIT_SECS",
                "must be at most 20 for a managed queue",
            ));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::local()
    }
}

impl FromEnv for QueueConfig {
    /// Reads `BOOKING_*` variables, falling back to the defaults of `QueueConfig::new`.
    fn from_env() -> Result<Self, ConfigError> {
        let d = Self::new(env_or_default("BOOKING_QUEUE_URL", ""));

        let config = Self {
            region: env_or_default("AWS_REGION", &d.region),
            visibility_timeout_seconds: env_parse(
                "BOOKING_VISIBILITY_TIMEOUT_SECS",
                d.visibility_timeout_seconds,
            )?,
            batch_size: env_parse("BOOKING_BATCH_SIZE", d.batch_size)?,
            max_receive_count: env_parse("BOOKING_MAX_RECEIVE_COUNT", d.max_receive_count)?,
            poll_wait_seconds: env_parse("BOOKING_POLL_WAIT_SECS", d.poll_wait_seconds)?,
            worker_count: env_parse("BOOKING_WORKER_COUNT", d.worker_count)?,
            nack_on_retryable: env_parse("BOOKING_NACK_ON_RETRYABLE", d.nack_on_retryable)?,
            shutdown_timeout_seconds: env_parse(
                "BOOKING_SHUTDOWN_TIMEOUT_SECS",
                d.shutdown_timeout_seconds,
            )?,
            ..d
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 9] = [
        "BOOKING_QUEUE_URL",
        "AWS_REGION",
        "BOOKING_VISIBILITY_TIMEOUT_SECS",
        "BOOKING_BATCH_SIZE",
        "BOOKING_MAX_RECEIVE_COUNT",
        "BOOKING_POLL_WAIT_SECS",
        "BOOKING_WORKER_COUNT",
        "BOOKING_NACK_ON_RETRYABLE",
        "BOOKING_SHUTDOWN_TIMEOUT_SECS",
    ];

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();

        assert!(!config.uses_managed_queue());
        assert_eq!(config.visibility_timeout_seconds, 30);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.max_receive_count, 3);
        assert_eq!(config.visibility_extend_interval(), Duration::from_secs(15));
        assert!(!config.nack_on_retryable);
        assert_eq!(config.store_backoff_initial_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = QueueConfig::new("https://sqs.eu-north-1.amazonaws.com/1/bookings.fifo")
            .with_region("eu-west-1")
            .with_batch_size(50)
            .with_worker_count(0)
            .with_max_receive_count(5)
            .with_empty_backoff_ms(10, 5);

        assert!(config.uses_managed_queue());
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.worker_count, 1);
        assert_eq!(config.max_receive_count, 5);
        assert_eq!(config.empty_backoff_max_ms, 10);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = QueueConfig::local();
        config.batch_size = 11;
        assert!(config.validate().is_err());

        let config = QueueConfig::local().with_visibility_timeout_seconds(0);
        assert!(config.validate().is_err());

        let config = QueueConfig::local().with_visibility_timeout_seconds(u64::MAX);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("BOOKING_VISIBILITY_TIMEOUT_SECS"));
        // Derived durations stay in range even for an unvalidated value
        assert!(config.visibility_extend_interval() > Duration::from_secs(43_200));
        assert!(QueueConfig::local()
            .with_visibility_timeout_seconds(MAX_VISIBILITY_TIMEOUT_SECS)
            .validate()
            .is_ok());

        let config = QueueConfig::new("https://queue").with_poll_wait_seconds(25);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("BOOKING_POLL_WAIT_SECS"));

        // Local queue accepts longer polls
        assert!(QueueConfig::local().with_poll_wait_seconds(25).validate().is_ok());
    }

    #[test]
    fn test_from_env_defaults() {
        temp_env::with_vars_unset(VARS, || {
            let config = QueueConfig::from_env().unwrap();
            assert_eq!(config, QueueConfig::local());
        });
    }

    #[test]
    fn test_from_env_overrides() {
        let vars: Vec<(&str, Option<&str>)> = VARS
            .iter()
            .map(|k| (*k, None))
            .chain([
                ("BOOKING_QUEUE_URL", Some("https://queue/bookings.fifo")),
                ("BOOKING_BATCH_SIZE", Some("5")),
                ("BOOKING_WORKER_COUNT", Some("12")),
                ("BOOKING_NACK_ON_RETRYABLE", Some("true")),
            ])
            .collect();

        temp_env::with_vars(vars, || {
            let config = QueueConfig::from_env().unwrap();
            assert!(config.uses_managed_queue());
            assert_eq!(config.batch_size, 5);
            assert_eq!(config.worker_count, 12);
            assert!(config.nack_on_retryable);
            assert_eq!(config.poll_wait_seconds, 20);
        });
    }

    #[test]
    fn test_from_env_rejects_oversized_batch() {
        temp_env::with_vars([("BOOKING_BATCH_SIZE", Some("100"))], || {
            let err = QueueConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("BOOKING_BATCH_SIZE"));
        });
    }
}
