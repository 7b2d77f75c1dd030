//! Backoff for store round-trips.
//!
//! Delay listeners keep polling through store outages and the demo binary
//! reconnects while Redis comes up. Both space their attempts out along a
//! [`RetryPolicy`]. Lock waiters poll at a fixed interval instead and only
//! need [`jittered`] so that instances released together do not collide.
//!
//! # Example
//!
//! ```rust
//! use seatlock_runtime::retry::{RetryPolicy, retry_with_predicate};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::new()
//!     .with_retries(5)
//!     .with_initial_delay(Duration::from_millis(100))
//!     .with_max_delay(Duration::from_secs(10));
//!
//! let seats = retry_with_predicate(
//!     &policy,
//!     || async { Ok::<_, String>(42) },
//!     |err: &String| err.contains("unavailable"),
//! )
//! .await?;
//! assert_eq!(seats, 42);
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff settings.
///
/// Defaults: 3 retries, 100ms first pause, doubling, capped at 30s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    retries: usize,
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy {
    /// Policy with the default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }

    /// Attempts allowed after the first failure.
    #[must_use]
    pub const fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Pause after the first failure.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Upper bound for any single pause.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Growth factor between consecutive pauses.
    #[must_use]
    pub const fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Attempts allowed after the first failure.
    #[must_use]
    pub const fn retries(&self) -> usize {
        self.retries
    }

    /// Pause after the `failures`-th consecutive failure (zero based):
    /// `initial_delay * factor ^ failures`, never above `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, failures: usize) -> Duration {
        let exponent = i32::try_from(failures.min(64)).unwrap_or(64);
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Spread `base` uniformly over `[base / 2, base * 3 / 2]`.
///
/// Pauses under 2ms are returned unchanged.
#[must_use]
pub fn jittered(base: Duration) -> Duration {
    let millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    if millis < 2 {
        return base;
    }
    let half = millis / 2;
    Duration::from_millis(rand::thread_rng().gen_range(half..=millis.saturating_add(half)))
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or `policy` runs out of retries.
///
/// # Errors
///
/// The first non-retryable error, or the last error once retries are
/// exhausted.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut failures = 0;
    loop {
        let error = match operation().await {
            Ok(value) => {
                if failures > 0 {
                    tracing::info!(failures, "Recovered after retrying");
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !should_retry(&error) {
            tracing::debug!(error = %error, "Permanent failure, not retrying");
            return Err(error);
        }
        if failures >= policy.retries {
            RetryMetrics::record_exhausted();
            tracing::error!(failures, error = %error, "Giving up after retries");
            return Err(error);
        }

        let pause = policy.delay_for_attempt(failures);
        RetryMetrics::record_attempt();
        tracing::warn!(failures, pause_ms = pause.as_millis(), error = %error, "Transient failure, retrying");
        tokio::time::sleep(pause).await;
        failures += 1;
    }
}
