//! Process-local mutexes keyed by business string.
//!
//! Used ahead of the cluster lock so that requests contending inside one
//! process queue locally instead of all polling the store. Entries are
//! created on first use and evicted after sitting idle.
//!
//! Composite operations lock several keys through
//! [`LocalLockCache::lock_all`], which sorts the keys first so two callers
//! can never wait on each other in opposite orders.

use crate::error::{LockError, Result};
use dashmap::DashMap;
use seatlock_core::LocalLockConfig;
use seatlock_runtime::metrics::LocalLockMetrics;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Guard of one local mutex. Dropping it releases the mutex.
pub type LocalGuard = OwnedMutexGuard<()>;

/// A process-local mutex.
///
/// `fair` mutexes hand the lock to waiters strictly in arrival order.
/// Non-fair ones let a newcomer take a free lock ahead of the queue.
#[derive(Debug)]
pub struct LocalMutex {
    key: String,
    fair: bool,
    inner: Arc<Mutex<()>>,
    last_used_ms: AtomicU64,
    epoch: Instant,
}

impl LocalMutex {
    fn new(key: &str, fair: bool, epoch: Instant) -> Self {
        Self {
            key: key.to_string(),
            fair,
            inner: Arc::new(Mutex::new(())),
            last_used_ms: AtomicU64::new(elapsed_ms(epoch)),
            epoch,
        }
    }

    /// Key this mutex guards.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether waiters are served in arrival order.
    #[must_use]
    pub const fn is_fair(&self) -> bool {
        self.fair
    }

    /// `true` if currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }

    /// Wait for the mutex.
    pub async fn lock(&self) -> LocalGuard {
        self.touch();
        if !self.fair {
            if let Ok(guard) = Arc::clone(&self.inner).try_lock_owned() {
                return guard;
            }
        }
        Arc::clone(&self.inner).lock_owned().await
    }

    /// Take the mutex only if it is free.
    #[must_use]
    pub fn try_lock(&self) -> Option<LocalGuard> {
        self.touch();
        Arc::clone(&self.inner).try_lock_owned().ok()
    }

    /// Wait up to `wait` for the mutex.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the wait runs out.
    pub async fn lock_for(&self, wait: Duration) -> Result<LocalGuard> {
        tokio::time::timeout(wait, self.lock())
            .await
            .map_err(|_| LockError::Timeout { lock_id: self.key.clone() })
    }

    fn touch(&self) {
        self.last_used_ms.store(elapsed_ms(self.epoch), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used_ms.load(Ordering::Relaxed);
        Duration::from_millis(elapsed_ms(self.epoch).saturating_sub(last))
    }
}

fn elapsed_ms(epoch: Instant) -> u64 {
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Guards for several keys, released in reverse acquisition order on drop.
#[derive(Debug)]
pub struct MultiLockGuard {
    guards: Vec<(String, LocalGuard)>,
}

impl MultiLockGuard {
    /// Keys held, in acquisition order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.guards.iter().map(|(key, _)| key.as_str())
    }

    /// Release everything now.
    pub fn release(self) {
        drop(self);
    }

    fn release_all(&mut self) {
        while let Some((key, guard)) = self.guards.pop() {
            drop(guard);
            tracing::trace!(key = %key, "Local lock released");
        }
    }
}

impl Drop for MultiLockGuard {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Lazily populated, idle-evicted cache of [`LocalMutex`]es.
#[derive(Debug)]
pub struct LocalLockCache {
    entries: DashMap<String, Arc<LocalMutex>>,
    idle_eviction: Duration,
    created: AtomicUsize,
    epoch: Instant,
}

impl LocalLockCache {
    /// Create a cache from its configuration.
    #[must_use]
    pub fn new(config: &LocalLockConfig) -> Self {
        Self::with_idle_eviction(config.idle_eviction)
    }

    /// Create a cache evicting entries idle for longer than `idle_eviction`.
    #[must_use]
    pub fn with_idle_eviction(idle_eviction: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_eviction,
            created: AtomicUsize::new(0),
            epoch: Instant::now(),
        }
    }

    /// Mutex for `key`, created on first use.
    ///
    /// Concurrent first lookups of one key all receive the same mutex. The
    /// fairness of an existing entry is kept.
    #[must_use]
    pub fn get(&self, key: &str, fair: bool) -> Arc<LocalMutex> {
        if let Some(existing) = self.entries.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.entries.entry(key.to_string()).or_insert_with(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key, fair, "Local mutex created");
            Arc::new(LocalMutex::new(key, fair, self.epoch))
        });
        let mutex = Arc::clone(entry.value());
        drop(entry);
        LocalLockMetrics::record_size(self.entries.len());
        mutex
    }

    /// Number of cached mutexes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mutexes created since the cache was built.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Lock every key, in sorted order without duplicates, waiting up to
    /// `wait` for each.
    ///
    /// If any key cannot be locked, the keys already locked are released
    /// in reverse order before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] naming the key that could not be
    /// locked.
    pub async fn lock_all<I, S>(&self, keys: I, fair: bool, wait: Duration) -> Result<MultiLockGuard>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        keys.sort();
        keys.dedup();

        let mut held = MultiLockGuard {
            guards: Vec::with_capacity(keys.len()),
        };
        for key in keys {
            match self.get(&key, fair).lock_for(wait).await {
                Ok(guard) => held.guards.push((key, guard)),
                Err(error) => {
                    tracing::debug!(
                        key = %key,
                        acquired = held.guards.len(),
                        "Composite local lock failed, rolling back"
                    );
                    held.release_all();
                    return Err(error);
                }
            }
        }
        Ok(held)
    }

    /// Run `work` while holding every key.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if the keys cannot be locked; `work`
    /// does not run in that case.
    pub async fn run_locked<I, S, W, Fut, T>(&self, keys: I, fair: bool, wait: Duration, work: W) -> Result<T>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        W: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.lock_all(keys, fair, wait).await?;
        let output = work().await;
        guard.release();
        Ok(output)
    }

    /// Drop entries idle longer than the eviction period and not in use.
    /// Returns the number evicted.
    pub fn evict_idle(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, mutex| {
            Arc::strong_count(mutex) > 1 || mutex.is_locked() || mutex.idle_for() < self.idle_eviction
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            LocalLockMetrics::record_evicted(evicted);
            LocalLockMetrics::record_size(self.entries.len());
            tracing::debug!(evicted, remaining = self.entries.len(), "Evicted idle local mutexes");
        }
        evicted
    }

    /// Spawn a task calling [`LocalLockCache::evict_idle`] every `interval`
    /// until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.evict_idle();
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("Local lock sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_first_access_creates_one_mutex() {
        let cache = Arc::new(LocalLockCache::with_idle_eviction(Duration::from_secs(60)));
        let barrier = Arc::new(tokio::sync::Barrier::new(1000));

        let handles: Vec<_> = (0..1000)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache.get("show-42", false)
                })
            })
            .collect();

        let mut mutexes = Vec::new();
        for handle in handles {
            mutexes.push(handle.await.unwrap());
        }

        assert_eq!(cache.created(), 1);
        assert_eq!(cache.len(), 1);
        assert!(mutexes.iter().all(|m| Arc::ptr_eq(m, &mutexes[0])));
    }

    #[tokio::test]
    async fn test_composite_failure_releases_acquired_keys() {
        let cache = LocalLockCache::with_idle_eviction(Duration::from_secs(60));
        let blocker = cache.get("C", false).try_lock().unwrap();

        let err = cache
            .lock_all(["B", "C", "A"], false, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { ref lock_id } if lock_id == "C"));

        assert!(cache.get("A", false).try_lock().is_some());
        assert!(cache.get("B", false).try_lock().is_some());
        drop(blocker);
    }

    #[tokio::test]
    async fn test_composite_success_sorted_and_released_on_drop() {
        let cache = LocalLockCache::with_idle_eviction(Duration::from_secs(60));
        let guard = cache
            .lock_all(["b", "a", "b", "c"], true, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(guard.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert!(cache.get("b", true).is_locked());

        drop(guard);
        for key in ["a", "b", "c"] {
            assert!(!cache.get(key, true).is_locked());
        }
    }

    #[tokio::test]
    async fn test_run_locked_returns_output() {
        let cache = LocalLockCache::with_idle_eviction(Duration::from_secs(60));
        let value = cache
            .run_locked(["x"], false, Duration::from_millis(10), || async { 7 })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(!cache.get("x", false).is_locked());
    }

    #[tokio::test]
    async fn test_fair_mutex_serves_in_order() {
        let cache = Arc::new(LocalLockCache::with_idle_eviction(Duration::from_secs(60)));
        let first = cache.get("fifo", true).lock().await;
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let cache = Arc::clone(&cache);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _guard = cache.get("fifo", true).lock().await;
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one starts.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_entries_evicted() {
        let cache = LocalLockCache::with_idle_eviction(Duration::from_secs(60));
        drop(cache.get("old", false));
        let busy = cache.get("busy", false);
        let _held = busy.try_lock().unwrap();
        drop(busy);

        tokio::time::advance(Duration::from_secs(61)).await;
        drop(cache.get("fresh", false));

        assert_eq!(cache.evict_idle(), 1);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evict_idle(), 0);
    }
}
