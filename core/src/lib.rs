//! # Seatlock Core
//!
//! Foundations of the seatlock coordination layer for high-contention
//! inventory sales:
//!
//! - **Shared store facade** ([`store`]): the contract every cross-process
//!   component depends on, including atomic multi-key scripts
//! - **In-memory store** ([`memory`], [`keyspace`]): a faithful single-process
//!   implementation of that contract
//! - **Configuration** ([`config`]): lock, local cache, delay and admission
//!   settings with environment loading
//! - **Environment** ([`environment`]): injectable clock
//!
//! ## Layering
//!
//! ```text
//! admission gate ─┐
//! cluster locks ──┼──► SharedStore ──► Redis | InMemoryStore
//! delay queues ───┘
//! ```

pub mod config;
pub mod error;
pub mod keyspace;
pub mod memory;
pub mod store;

pub use config::{
    AdmissionConfig, ConfigError, DelayConfig, LocalLockConfig, LockSettings, SeatlockConfig,
    StoreConfig,
};
pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use store::{AtomicScript, ScriptValue, SharedStore};

/// Environment module - injectable dependencies
///
/// Time is read through [`Clock`](environment::Clock) so expiry windows,
/// not-before timestamps and rate buckets can be driven deterministically
/// in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;

        /// Current time in epoch milliseconds.
        fn now_millis(&self) -> i64 {
            self.now().timestamp_millis()
        }
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let first = clock.now_millis();
        let second = clock.now_millis();
        assert!(second >= first);
    }
}
