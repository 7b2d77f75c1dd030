//! Booking flow configuration.
//!
//! Loads from environment variables with defaults, next to the
//! coordination layer's own [`SeatlockConfig`](seatlock_core::SeatlockConfig).

use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Settings of the reference booking flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketingConfig {
    /// How long a reservation waits for payment before its seats return.
    ///
    /// Default: 15 minutes
    pub payment_window: Duration,

    /// Window in which an identical reservation request is refused.
    ///
    /// Default: 3 seconds
    pub repeat_window: Duration,

    /// Delay before retrying an expiry that hit a busy show.
    ///
    /// Default: 5 seconds
    pub expiry_retry: Duration,

    /// Wait for the process-local show and client locks.
    ///
    /// Default: 3 seconds
    pub local_wait: Duration,

    /// Address to expose Prometheus metrics on, if any.
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for TicketingConfig {
    fn default() -> Self {
        Self {
            payment_window: Duration::from_secs(15 * 60),
            repeat_window: Duration::from_secs(3),
            expiry_retry: Duration::from_secs(5),
            local_wait: Duration::from_secs(3),
            metrics_addr: None,
        }
    }
}

impl TicketingConfig {
    /// Load from environment variables.
    ///
    /// | Variable | Field |
    /// |---|---|
    /// | `SEATLOCK_PAYMENT_WINDOW_SECS` | payment window |
    /// | `SEATLOCK_REPEAT_WINDOW_MS` | repeat window |
    /// | `SEATLOCK_EXPIRY_RETRY_SECS` | expiry retry delay |
    /// | `SEATLOCK_LOCAL_WAIT_MS` | local lock wait |
    /// | `SEATLOCK_METRICS_ADDR` | metrics address |
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            payment_window: env_parse("SEATLOCK_PAYMENT_WINDOW_SECS")
                .map_or(defaults.payment_window, Duration::from_secs),
            repeat_window: env_parse("SEATLOCK_REPEAT_WINDOW_MS")
                .map_or(defaults.repeat_window, Duration::from_millis),
            expiry_retry: env_parse("SEATLOCK_EXPIRY_RETRY_SECS")
                .map_or(defaults.expiry_retry, Duration::from_secs),
            local_wait: env_parse("SEATLOCK_LOCAL_WAIT_MS").map_or(defaults.local_wait, Duration::from_millis),
            metrics_addr: env::var("SEATLOCK_METRICS_ADDR").ok().and_then(|addr| addr.parse().ok()),
        }
    }

    /// Set the payment window.
    #[must_use]
    pub const fn with_payment_window(mut self, window: Duration) -> Self {
        self.payment_window = window;
        self
    }

    /// Set the repeat window.
    #[must_use]
    pub const fn with_repeat_window(mut self, window: Duration) -> Self {
        self.repeat_window = window;
        self
    }

    /// Set the expiry retry delay.
    #[must_use]
    pub const fn with_expiry_retry(mut self, delay: Duration) -> Self {
        self.expiry_retry = delay;
        self
    }

    /// Set the local lock wait.
    #[must_use]
    pub const fn with_local_wait(mut self, wait: Duration) -> Self {
        self.local_wait = wait;
        self
    }
}

fn env_parse(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}
