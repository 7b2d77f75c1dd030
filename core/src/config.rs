//! Configuration for the coordination layer.
//!
//! Values come from the application (usually [`SeatlockConfig::from_env`]);
//! every section has defaults that suit a single flash-sale deployment.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A value is outside its allowed range.
    #[error("Invalid configuration `{field}`: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeatlockConfig {
    /// Shared store connection
    pub store: StoreConfig,
    /// Cluster lock defaults
    pub locks: LockSettings,
    /// Process-local lock cache
    pub local: LocalLockConfig,
    /// Delay dispatcher
    pub delay: DelayConfig,
    /// Admission gates
    pub admission: AdmissionConfig,
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    pub url: String,
    /// Environment/tenant prefix for every key and lock identifier
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "seatlock".to_string(),
        }
    }
}

/// Cluster lock defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSettings {
    /// How long `try_lock` waits before giving up.
    ///
    /// Default: 10 seconds
    pub wait_time: Duration,

    /// Lease after which a held lock expires on its own. `None` keeps the
    /// lock until it is released.
    ///
    /// Default: unset
    pub lease_time: Option<Duration>,

    /// Pause between acquisition attempts while waiting (jittered).
    ///
    /// Default: 50 milliseconds
    pub retry_interval: Duration,

    /// How long a fair-lock waiter stays queued without polling before it
    /// is dropped from the queue.
    ///
    /// Default: 5 seconds
    pub fair_waiter_ttl: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(10),
            lease_time: None,
            retry_interval: Duration::from_millis(50),
            fair_waiter_ttl: Duration::from_secs(5),
        }
    }
}

impl LockSettings {
    /// Set the default wait time.
    #[must_use]
    pub const fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    /// Set the default lease.
    #[must_use]
    pub const fn with_lease_time(mut self, lease: Option<Duration>) -> Self {
        self.lease_time = lease;
        self
    }

    /// Set the polling interval used while waiting.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }
}

/// Process-local lock cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalLockConfig {
    /// Idle time after which an unused mutex is evicted.
    ///
    /// Default: 48 hours
    pub idle_eviction: Duration,

    /// How often the background sweeper looks for idle entries.
    ///
    /// Default: 10 minutes
    pub sweep_interval: Duration,
}

impl Default for LocalLockConfig {
    fn default() -> Self {
        Self {
            idle_eviction: Duration::from_secs(48 * 60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Delay dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    /// Partitions per topic. Producers and consumers must agree on it.
    ///
    /// Default: 5
    pub partitions: usize,

    /// Longest sleep of an idle listener between polls.
    ///
    /// Default: 100 milliseconds
    pub poll_interval: Duration,

    /// How long a dequeued item may stay unacknowledged before it is
    /// returned to the ready set.
    ///
    /// Default: 30 seconds
    pub visibility_timeout: Duration,

    /// Upper bound on a single handler invocation. Must stay below
    /// `visibility_timeout` so an item is not redelivered while its first
    /// handler still runs.
    ///
    /// Default: 20 seconds
    pub handler_timeout: Duration,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            partitions: 5,
            poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(20),
        }
    }
}

impl DelayConfig {
    /// Set the partition count.
    #[must_use]
    pub const fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = partitions;
        self
    }

    /// Set the idle poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the visibility timeout.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the handler timeout.
    #[must_use]
    pub const fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }
}

/// Admission gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Rate gate window.
    ///
    /// Default: 1 second
    pub rate_window: Duration,

    /// Requests allowed per client and endpoint in one window.
    ///
    /// Default: 20
    pub rate_threshold: u32,

    /// Failed attempts after which a challenge is required.
    ///
    /// Default: 3
    pub challenge_threshold: u32,

    /// How long failed attempts are remembered.
    ///
    /// Default: 10 minutes
    pub challenge_window: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            rate_window: Duration::from_secs(1),
            rate_threshold: 20,
            challenge_threshold: 3,
            challenge_window: Duration::from_secs(10 * 60),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

impl SeatlockConfig {
    /// Load configuration from `SEATLOCK_*` environment variables, falling
    /// back to defaults for anything unset or unparsable.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `SEATLOCK_REDIS_URL` | store URL |
    /// | `SEATLOCK_KEY_PREFIX` | environment/tenant prefix |
    /// | `SEATLOCK_LOCK_WAIT_SECS` | lock wait time |
    /// | `SEATLOCK_LOCK_LEASE_SECS` | lock lease (unset = none) |
    /// | `SEATLOCK_LOCK_RETRY_MS` | polling interval |
    /// | `SEATLOCK_LOCAL_IDLE_SECS` | local mutex idle eviction |
    /// | `SEATLOCK_DELAY_PARTITIONS` | partitions per topic |
    /// | `SEATLOCK_DELAY_POLL_MS` | idle poll interval |
    /// | `SEATLOCK_DELAY_VISIBILITY_SECS` | redelivery timeout |
    /// | `SEATLOCK_RATE_WINDOW_MS` | rate gate window |
    /// | `SEATLOCK_RATE_THRESHOLD` | rate gate threshold |
    /// | `SEATLOCK_CHALLENGE_THRESHOLD` | challenge gate threshold |
    /// | `SEATLOCK_CHALLENGE_WINDOW_SECS` | challenge failure memory |
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            store: StoreConfig {
                url: env::var("SEATLOCK_REDIS_URL").unwrap_or(defaults.store.url),
                key_prefix: env::var("SEATLOCK_KEY_PREFIX").unwrap_or(defaults.store.key_prefix),
            },
            locks: LockSettings {
                wait_time: env_secs("SEATLOCK_LOCK_WAIT_SECS").unwrap_or(defaults.locks.wait_time),
                lease_time: env_secs("SEATLOCK_LOCK_LEASE_SECS").or(defaults.locks.lease_time),
                retry_interval: env_millis("SEATLOCK_LOCK_RETRY_MS")
                    .unwrap_or(defaults.locks.retry_interval),
                fair_waiter_ttl: defaults.locks.fair_waiter_ttl,
            },
            local: LocalLockConfig {
                idle_eviction: env_secs("SEATLOCK_LOCAL_IDLE_SECS")
                    .unwrap_or(defaults.local.idle_eviction),
                sweep_interval: defaults.local.sweep_interval,
            },
            delay: DelayConfig {
                partitions: env_parse("SEATLOCK_DELAY_PARTITIONS")
                    .unwrap_or(defaults.delay.partitions),
                poll_interval: env_millis("SEATLOCK_DELAY_POLL_MS")
                    .unwrap_or(defaults.delay.poll_interval),
                visibility_timeout: env_secs("SEATLOCK_DELAY_VISIBILITY_SECS")
                    .unwrap_or(defaults.delay.visibility_timeout),
                handler_timeout: defaults.delay.handler_timeout,
            },
            admission: AdmissionConfig {
                rate_window: env_millis("SEATLOCK_RATE_WINDOW_MS")
                    .unwrap_or(defaults.admission.rate_window),
                rate_threshold: env_parse("SEATLOCK_RATE_THRESHOLD")
                    .unwrap_or(defaults.admission.rate_threshold),
                challenge_threshold: env_parse("SEATLOCK_CHALLENGE_THRESHOLD")
                    .unwrap_or(defaults.admission.challenge_threshold),
                challenge_window: env_secs("SEATLOCK_CHALLENGE_WINDOW_SECS")
                    .unwrap_or(defaults.admission.challenge_window),
            },
        }
    }

    /// Reject values the components cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid { field, reason: reason.to_string() }
        }

        if self.store.key_prefix.is_empty() {
            return Err(invalid("store.key_prefix", "must not be empty"));
        }
        if self.locks.retry_interval.is_zero() {
            return Err(invalid("locks.retry_interval", "must be positive"));
        }
        if self.locks.lease_time.is_some_and(|lease| lease.is_zero()) {
            return Err(invalid("locks.lease_time", "must be positive when set"));
        }
        if self.local.sweep_interval.is_zero() {
            return Err(invalid("local.sweep_interval", "must be positive"));
        }
        if self.delay.partitions == 0 {
            return Err(invalid("delay.partitions", "must be at least 1"));
        }
        if self.delay.poll_interval.is_zero() {
            return Err(invalid("delay.poll_interval", "must be positive"));
        }
        if self.delay.visibility_timeout.is_zero() {
            return Err(invalid("delay.visibility_timeout", "must be positive"));
        }
        if self.delay.handler_timeout.is_zero() {
            return Err(invalid("delay.handler_timeout", "must be positive"));
        }
        if self.delay.handler_timeout >= self.delay.visibility_timeout {
            return Err(invalid("delay.handler_timeout", "must be shorter than delay.visibility_timeout"));
        }
        if self.admission.rate_window.as_millis() == 0 {
            return Err(invalid("admission.rate_window", "must be at least 1ms"));
        }
        if self.admission.rate_threshold == 0 {
            return Err(invalid("admission.rate_threshold", "must be at least 1"));
        }
        if self.admission.challenge_threshold == 0 {
            return Err(invalid("admission.challenge_threshold", "must be at least 1"));
        }
        if self.admission.challenge_window.as_millis() == 0 {
            return Err(invalid("admission.challenge_window", "must be at least 1ms"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SeatlockConfig::default();
        assert_eq!(config.locks.wait_time, Duration::from_secs(10));
        assert_eq!(config.locks.lease_time, None);
        assert_eq!(config.local.idle_eviction, Duration::from_secs(172_800));
        assert_eq!(config.delay.partitions, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let mut config = SeatlockConfig::default();
        config.delay.partitions = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "delay.partitions", .. })
        ));
    }

    #[test]
    fn test_zero_lease_rejected() {
        let mut config = SeatlockConfig::default();
        config.locks = config.locks.with_lease_time(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    fn rejected_field(config: &SeatlockConfig) -> Option<&'static str> {
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => Some(field),
            _ => None,
        }
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let mut config = SeatlockConfig::default();
        config.local.sweep_interval = Duration::ZERO;
        assert_eq!(rejected_field(&config), Some("local.sweep_interval"));
    }

    #[test]
    fn test_handler_must_finish_before_redelivery() {
        let mut config = SeatlockConfig::default();
        config.delay = config
            .delay
            .with_visibility_timeout(Duration::from_secs(1))
            .with_handler_timeout(Duration::from_secs(60));
        assert_eq!(rejected_field(&config), Some("delay.handler_timeout"));

        config.delay = config.delay.with_handler_timeout(Duration::from_secs(1));
        assert_eq!(rejected_field(&config), Some("delay.handler_timeout"));

        config.delay = config.delay.with_handler_timeout(Duration::from_millis(900));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeouts_and_windows_rejected() {
        let mut config = SeatlockConfig::default();
        config.delay = config.delay.with_visibility_timeout(Duration::ZERO);
        assert_eq!(rejected_field(&config), Some("delay.visibility_timeout"));

        let mut config = SeatlockConfig::default();
        config.delay = config.delay.with_handler_timeout(Duration::ZERO);
        assert_eq!(rejected_field(&config), Some("delay.handler_timeout"));

        let mut config = SeatlockConfig::default();
        config.admission.challenge_window = Duration::ZERO;
        assert_eq!(rejected_field(&config), Some("admission.challenge_window"));
    }
}
