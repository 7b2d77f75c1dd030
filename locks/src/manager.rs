//! One [`Locker`] per [`LockKind`], built once per manager.

use crate::error::Result;
use crate::kinds::{FairProtocol, LockKind, ReadWriteProtocol, ReentrantProtocol};
use crate::locker::{Locker, ScriptLocker};
use seatlock_core::environment::{Clock, SystemClock};
use seatlock_core::store::{duration_ms, SharedStore};
use seatlock_core::LockSettings;
use std::sync::Arc;

/// Source of cluster lockers.
///
/// Construct once at start-up and share by `Arc`:
///
/// ```
/// use seatlock_core::{InMemoryStore, LockSettings};
/// use seatlock_locks::{HolderId, LockIdentifier, LockKind, LockManager};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let manager = Arc::new(LockManager::new(Arc::new(InMemoryStore::new()), LockSettings::default()));
/// let locker = manager.get(LockKind::Reentrant);
/// let id = LockIdentifier::new("demo-seat-1");
/// let holder = HolderId::new();
/// assert!(locker.try_lock(&id, &holder, Duration::ZERO, None).await.unwrap());
/// locker.unlock(&id, &holder).await.unwrap();
/// # });
/// ```
#[derive(Debug)]
pub struct LockManager {
    settings: LockSettings,
    reentrant: Arc<dyn Locker>,
    fair: Arc<dyn Locker>,
    read: Arc<dyn Locker>,
    write: Arc<dyn Locker>,
}

impl LockManager {
    /// Create a manager using the system clock.
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, settings: LockSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    /// Create a manager whose fair-lock waiter deadlines follow `clock`.
    #[must_use]
    pub fn with_clock(store: Arc<dyn SharedStore>, settings: LockSettings, clock: Arc<dyn Clock>) -> Self {
        let retry = settings.retry_interval;
        let waiter_ttl_ms = duration_ms(settings.fair_waiter_ttl);

        let manager = Self {
            reentrant: Arc::new(ScriptLocker::new(
                ReentrantProtocol,
                Arc::clone(&store),
                Arc::clone(&clock),
                retry,
            )),
            fair: Arc::new(ScriptLocker::new(
                FairProtocol::new(waiter_ttl_ms),
                Arc::clone(&store),
                Arc::clone(&clock),
                retry,
            )),
            read: Arc::new(ScriptLocker::new(
                ReadWriteProtocol::read(),
                Arc::clone(&store),
                Arc::clone(&clock),
                retry,
            )),
            write: Arc::new(ScriptLocker::new(
                ReadWriteProtocol::write(),
                store,
                clock,
                retry,
            )),
            settings,
        };
        tracing::info!(
            wait_ms = manager.settings.wait_time.as_millis(),
            retry_ms = retry.as_millis(),
            "Lock manager ready"
        );
        manager
    }

    /// Locker for `kind`. Repeated calls return the same instance.
    #[must_use]
    pub fn get(&self, kind: LockKind) -> Arc<dyn Locker> {
        Arc::clone(match kind {
            LockKind::Reentrant => &self.reentrant,
            LockKind::Fair => &self.fair,
            LockKind::Read => &self.read,
            LockKind::Write => &self.write,
        })
    }

    /// Locker for a kind given by name.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`](crate::LockError::Configuration)
    /// for unknown names.
    pub fn get_named(&self, kind: &str) -> Result<Arc<dyn Locker>> {
        Ok(self.get(kind.parse()?))
    }

    /// Defaults applied when callers do not specify wait or lease.
    #[must_use]
    pub const fn settings(&self) -> &LockSettings {
        &self.settings
    }
}
