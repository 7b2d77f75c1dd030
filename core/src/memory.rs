//! In-memory [`SharedStore`] implementation.
//!
//! A single [`KeySpace`] guarded by one mutex. Every command and every
//! script runs while holding that mutex, so scripts are atomic with respect
//! to each other exactly as they are on Redis. Intended for tests and for
//! single-process deployments; it provides no cross-process exclusivity.

use crate::environment::{Clock, SystemClock};
use crate::error::{Result, StoreError};
use crate::keyspace::KeySpace;
use crate::store::{duration_ms, AtomicScript, ScriptValue, SharedStore};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Shared store held entirely in process memory.
///
/// Clones share the same key space.
///
/// # Example
///
/// ```
/// use seatlock_core::memory::InMemoryStore;
/// use seatlock_core::store::SharedStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryStore::new();
/// store.set("greeting", "hello", None).await.unwrap();
/// assert_eq!(store.get("greeting").await.unwrap().as_deref(), Some("hello"));
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    space: Arc<Mutex<KeySpace>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl InMemoryStore {
    /// Create an empty store driven by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store whose expiries follow `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            space: Arc::new(Mutex::new(KeySpace::new())),
            clock,
        }
    }

    /// Number of live keys (for assertions in tests).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store mutex is poisoned.
    pub fn key_count(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    /// Run a closure against the key space atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the store mutex is poisoned,
    /// or whatever the closure returns.
    pub fn with_space<T>(&self, f: impl FnOnce(&mut KeySpace) -> Result<T>) -> Result<T> {
        let mut space = self.lock()?;
        f(&mut space)
    }

    fn lock(&self) -> Result<MutexGuard<'_, KeySpace>> {
        let mut space = self
            .space
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store mutex poisoned".into()))?;
        space.set_now(self.clock.now().timestamp_millis());
        Ok(space)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.lock()?.get(key)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.lock()?.set(key, value, ttl.map(duration_ms));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.lock()?.del(key))
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.lock()?.incr_by(key, delta)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.lock()?.pexpire(key, duration_ms(ttl)))
    }

    async fn eval(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue> {
        let mut space = self.lock()?;
        let result = script.apply(&mut space, keys, args);
        if let Err(error) = &result {
            tracing::debug!(script = script.name(), error = %error, "In-memory script failed");
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{int_arg, key_arg};

    struct IncrementTwice;

    impl AtomicScript for IncrementTwice {
        fn name(&self) -> &'static str {
            "increment_twice"
        }

        fn source(&self) -> &'static str {
            "return redis.call('incrby', KEYS[1], ARGV[1]) + redis.call('incrby', KEYS[1], ARGV[1])"
        }

        fn apply(
            &self,
            space: &mut KeySpace,
            keys: &[String],
            args: &[String],
        ) -> Result<ScriptValue> {
            let key = key_arg(self.name(), keys, 0)?;
            let delta = int_arg(self.name(), args, 0)?;
            let first = space.incr_by(key, delta)?;
            let second = space.incr_by(key, delta)?;
            Ok(ScriptValue::Int(first + second))
        }
    }

    #[tokio::test]
    async fn test_basic_commands() {
        let store = InMemoryStore::new();
        assert_eq!(store.increment("hits", 2).await.unwrap(), 2);
        assert_eq!(store.increment("hits", 3).await.unwrap(), 5);
        assert!(store.expire("hits", Duration::from_secs(60)).await.unwrap());
        assert!(!store.expire("missing", Duration::from_secs(60)).await.unwrap());
        assert!(store.delete("hits").await.unwrap());
        assert_eq!(store.get("hits").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eval_runs_in_process_twin() {
        let store = InMemoryStore::new();
        let value = store
            .eval(&IncrementTwice, &["n".to_string()], &["4".to_string()])
            .await
            .unwrap();
        assert_eq!(value, ScriptValue::Int(4 + 8));
    }

    #[tokio::test]
    async fn test_eval_reports_bad_arguments() {
        let store = InMemoryStore::new();
        let result = store.eval(&IncrementTwice, &["n".to_string()], &[]).await;
        assert!(matches!(result, Err(StoreError::Script { .. })));
    }
}
