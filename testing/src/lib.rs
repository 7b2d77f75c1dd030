//! # Seatlock Testing
//!
//! Test doubles for the coordination layer.
//!
//! This crate provides:
//! - [`mocks::ManualClock`]: time that only moves when a test says so
//! - [`mocks::UnavailableStore`]: a store whose every call fails
//! - [`recorder::Recorder`]: captures values handed to callbacks and lets a
//!   test wait for them
//! - [`init_test_tracing`]: one-line log output for failing tests
//!
//! ## Example
//!
//! ```
//! use seatlock_testing::mocks::test_clock;
//! use seatlock_core::environment::Clock;
//! use std::time::Duration;
//!
//! let clock = test_clock();
//! let start = clock.now_millis();
//! clock.advance(Duration::from_secs(60));
//! assert_eq!(clock.now_millis() - start, 60_000);
//! ```

use seatlock_core::environment::Clock;

/// Mock implementations of environment and store traits.
pub mod mocks {
    use super::Clock;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use seatlock_core::store::{AtomicScript, ScriptValue, SharedStore};
    use seatlock_core::{Result, StoreError};
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the store or component under test.
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        millis: Arc<AtomicI64>,
    }

    impl ManualClock {
        /// Create a clock frozen at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                millis: Arc::new(AtomicI64::new(time.timestamp_millis())),
            }
        }

        /// Move time forward.
        pub fn advance(&self, by: Duration) {
            let delta = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
            self.millis.fetch_add(delta, Ordering::SeqCst);
        }

        /// Jump to an absolute time.
        pub fn set(&self, time: DateTime<Utc>) {
            self.millis.store(time.timestamp_millis(), Ordering::SeqCst);
        }

        /// Shared trait-object handle, for constructors taking `Arc<dyn Clock>`.
        #[must_use]
        pub fn shared(&self) -> Arc<dyn Clock> {
            Arc::new(self.clone())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            Utc.timestamp_millis_opt(self.millis.load(Ordering::SeqCst))
                .single()
                .unwrap_or_default()
        }

        fn now_millis(&self) -> i64 {
            self.millis.load(Ordering::SeqCst)
        }
    }

    /// Manual clock starting at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> ManualClock {
        ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_default(),
        )
    }

    /// Store that is never reachable.
    ///
    /// Every call fails with [`StoreError::Unavailable`] and is counted, so
    /// tests can check that callers propagate the failure instead of
    /// swallowing it.
    #[derive(Debug, Clone, Default)]
    pub struct UnavailableStore {
        calls: Arc<AtomicUsize>,
    }

    impl UnavailableStore {
        /// Create the store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of calls attempted so far.
        #[must_use]
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn refuse<T>(&self, operation: &str) -> Result<T> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable(format!("{operation}: connection refused")))
        }
    }

    #[async_trait]
    impl SharedStore for UnavailableStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            self.refuse("GET")
        }

        async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> Result<()> {
            self.refuse("SET")
        }

        async fn delete(&self, _key: &str) -> Result<bool> {
            self.refuse("DEL")
        }

        async fn increment(&self, _key: &str, _delta: i64) -> Result<i64> {
            self.refuse("INCRBY")
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            self.refuse("PEXPIRE")
        }

        async fn eval(
            &self,
            script: &dyn AtomicScript,
            _keys: &[String],
            _args: &[String],
        ) -> Result<ScriptValue> {
            self.refuse(script.name())
        }
    }
}

/// Capture values produced by callbacks under test.
pub mod recorder {
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Thread-safe log of recorded values.
    ///
    /// Clones share the same log. Intended for delay handlers, fallback
    /// closures and other callbacks whose invocations a test asserts on.
    #[derive(Debug)]
    pub struct Recorder<T> {
        items: Arc<Mutex<Vec<T>>>,
        notify: Arc<Notify>,
    }

    impl<T> Clone for Recorder<T> {
        fn clone(&self) -> Self {
            Self {
                items: Arc::clone(&self.items),
                notify: Arc::clone(&self.notify),
            }
        }
    }

    impl<T> Default for Recorder<T> {
        fn default() -> Self {
            Self {
                items: Arc::new(Mutex::new(Vec::new())),
                notify: Arc::new(Notify::new()),
            }
        }
    }

    impl<T: Clone> Recorder<T> {
        /// Create an empty recorder.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Append a value and wake waiters.
        pub fn record(&self, item: T) {
            self.items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(item);
            self.notify.notify_waiters();
        }

        /// Snapshot of everything recorded.
        #[must_use]
        pub fn items(&self) -> Vec<T> {
            self.items
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of recorded values.
        #[must_use]
        pub fn len(&self) -> usize {
            self.items.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// `true` if nothing was recorded.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Wait until at least `count` values are recorded. Returns `false`
        /// if `timeout` elapses first.
        pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.len() >= count {
                    return true;
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return self.len() >= count;
                }
            }
        }
    }
}

/// Install a compact `tracing` subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::mocks::{test_clock, UnavailableStore};
    use super::recorder::Recorder;
    use super::Clock;
    use seatlock_core::store::SharedStore;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_moves_only_when_advanced() {
        let clock = test_clock();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        let shared = clock.clone();
        shared.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_millis() - start.timestamp_millis(), 1500);
    }

    #[tokio::test]
    async fn test_unavailable_store_counts_calls() {
        let store = UnavailableStore::new();
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.increment("k", 1).await.is_err());
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn test_recorder_wait_for() {
        let recorder = Recorder::new();
        let writer = recorder.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.record("first");
            writer.record("second");
        });

        assert!(recorder.wait_for(2, Duration::from_secs(2)).await);
        assert_eq!(recorder.items(), vec!["first", "second"]);
        assert!(!recorder.wait_for(3, Duration::from_millis(20)).await);
    }
}
