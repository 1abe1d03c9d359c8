//! Storage configuration.
//!
//! The lock, transaction and component code only consume plain durations;
//! every default lives here.

use std::time::Duration;

use thiserror::Error;
use tracing::info;

/// Prefix of the environment overrides read by [`StorageOptions::from_env`].
pub const ENV_PREFIX: &str = "JOBVAULT_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name}: expected a whole number of seconds, got {value:?}")]
    Malformed { name: String, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Options shared by every component built on one storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageOptions {
    /// Timeout for the commit lease and the job-update lease.
    pub transactional_lock_timeout: Duration,
    /// Expiration sweep cadence, also its lease timeout.
    pub expiration_check_interval: Duration,
    /// Counter aggregation cadence, also its lease timeout.
    pub counters_aggregate_interval: Duration,
    /// Raw counters folded per aggregation cycle.
    pub counters_aggregate_max_item_count: usize,
    pub queue_poll_interval: Duration,
    pub job_keep_alive_interval: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            transactional_lock_timeout: Duration::from_secs(30),
            expiration_check_interval: Duration::from_secs(2 * 60),
            counters_aggregate_interval: Duration::from_secs(2 * 60),
            counters_aggregate_max_item_count: 100,
            queue_poll_interval: Duration::from_secs(15),
            job_keep_alive_interval: Duration::from_secs(15),
        }
    }
}

impl StorageOptions {
    /// Defaults overridden by `JOBVAULT_*` variables (seconds, or a count for
    /// `JOBVAULT_COUNTERS_AGGREGATE_MAX_ITEM_COUNT`).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();

        let secs = |suffix: &str, current: Duration| -> Result<Duration, ConfigError> {
            Ok(parse(&lookup, suffix)?.map(Duration::from_secs).unwrap_or(current))
        };

        options.transactional_lock_timeout =
            secs("TRANSACTIONAL_LOCK_TIMEOUT_SECS", options.transactional_lock_timeout)?;
        options.expiration_check_interval =
            secs("EXPIRATION_CHECK_INTERVAL_SECS", options.expiration_check_interval)?;
        options.counters_aggregate_interval =
            secs("COUNTERS_AGGREGATE_INTERVAL_SECS", options.counters_aggregate_interval)?;
        options.queue_poll_interval = secs("QUEUE_POLL_INTERVAL_SECS", options.queue_poll_interval)?;
        options.job_keep_alive_interval =
            secs("JOB_KEEP_ALIVE_INTERVAL_SECS", options.job_keep_alive_interval)?;

        if let Some(count) = parse(&lookup, "COUNTERS_AGGREGATE_MAX_ITEM_COUNT")? {
            options.counters_aggregate_max_item_count = count as usize;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn with_transactional_lock_timeout(mut self, timeout: Duration) -> Self {
        self.transactional_lock_timeout = timeout;
        self
    }

    pub fn with_expiration_check_interval(mut self, interval: Duration) -> Self {
        self.expiration_check_interval = interval;
        self
    }

    pub fn with_counters_aggregate_interval(mut self, interval: Duration) -> Self {
        self.counters_aggregate_interval = interval;
        self
    }

    pub fn with_counters_aggregate_max_item_count(mut self, count: usize) -> Self {
        self.counters_aggregate_max_item_count = count;
        self
    }

    pub fn with_queue_poll_interval(mut self, interval: Duration) -> Self {
        self.queue_poll_interval = interval;
        self
    }

    pub fn with_job_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.job_keep_alive_interval = interval;
        self
    }

    /// Reject intervals and counts that would make a component spin.
    ///
    /// A zero `transactional_lock_timeout` is allowed: commits then try the
    /// lease exactly once per attempt.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.expiration_check_interval.is_zero() {
            return Err(ConfigError::Zero("expiration_check_interval"));
        }
        if self.counters_aggregate_interval.is_zero() {
            return Err(ConfigError::Zero("counters_aggregate_interval"));
        }
        if self.counters_aggregate_max_item_count == 0 {
            return Err(ConfigError::Zero("counters_aggregate_max_item_count"));
        }
        if self.queue_poll_interval.is_zero() {
            return Err(ConfigError::Zero("queue_poll_interval"));
        }
        if self.job_keep_alive_interval.is_zero() {
            return Err(ConfigError::Zero("job_keep_alive_interval"));
        }
        Ok(())
    }

    pub fn log_options(&self) {
        info!(
            transactional_lock_timeout = ?self.transactional_lock_timeout,
            expiration_check_interval = ?self.expiration_check_interval,
            counters_aggregate_interval = ?self.counters_aggregate_interval,
            counters_aggregate_max_item_count = self.counters_aggregate_max_item_count,
            queue_poll_interval = ?self.queue_poll_interval,
            job_keep_alive_interval = ?self.job_keep_alive_interval,
            "using storage options"
        );
    }
}

fn parse(lookup: &impl Fn(&str) -> Option<String>, suffix: &str) -> Result<Option<u64>, ConfigError> {
    let name = format!("{ENV_PREFIX}{suffix}");
    match lookup(&name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::Malformed { name, value: raw }),
    }
}
