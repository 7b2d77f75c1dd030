//! The [`Locker`] contract and its store-backed implementation.

use crate::error::{LockError, Result};
use crate::kinds::{Attempt, HolderRelease, KeyExists, LockKind, LockProtocol};
use crate::naming::LockIdentifier;
use async_trait::async_trait;
use seatlock_core::environment::Clock;
use seatlock_core::store::{duration_ms, AtomicScript, SharedStore};
use seatlock_runtime::metrics::LockMetrics;
use seatlock_runtime::retry::jittered;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Logical owner of a cluster lock.
///
/// Re-entry and unlock ownership are checked against it. One holder per
/// request or task is the usual choice; a holder shared by two tasks lets
/// both in at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HolderId(String);

impl HolderId {
    /// Fresh random holder.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Holder with a known name.
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Holder string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HolderId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cluster lock of one kind.
#[async_trait]
pub trait Locker: Send + Sync + fmt::Debug {
    /// Kind implemented by this locker.
    fn kind(&self) -> LockKind;

    /// Try to acquire for up to `wait`.
    ///
    /// Returns `Ok(false)` when the wait runs out. With a `lease`, the lock
    /// expires on its own that long after acquisition.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] if the store fails.
    async fn try_lock(
        &self,
        id: &LockIdentifier,
        holder: &HolderId,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<bool>;

    /// Acquire, waiting as long as it takes.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] if the store fails.
    async fn lock(&self, id: &LockIdentifier, holder: &HolderId, lease: Option<Duration>) -> Result<()>;

    /// Release one acquisition by `holder`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHeld`] if `holder` does not hold the lock
    /// (never acquired, already released, or expired lease), and
    /// [`LockError::Store`] if the store fails.
    async fn unlock(&self, id: &LockIdentifier, holder: &HolderId) -> Result<()>;

    /// `true` if anyone holds the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] if the store fails.
    async fn is_locked(&self, id: &LockIdentifier) -> Result<bool>;

    /// Release regardless of holder (administrative). Returns `true` if the
    /// lock was held.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] if the store fails.
    async fn force_unlock(&self, id: &LockIdentifier) -> Result<bool>;
}

/// [`Locker`] running a [`LockProtocol`] against the shared store, polling
/// at jittered intervals while contended.
pub(crate) struct ScriptLocker<P> {
    protocol: P,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    retry_interval: Duration,
}

impl<P: fmt::Debug> fmt::Debug for ScriptLocker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptLocker")
            .field("protocol", &self.protocol)
            .field("store", &self.store)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

impl<P: LockProtocol> ScriptLocker<P> {
    pub(crate) fn new(
        protocol: P,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            protocol,
            store,
            clock,
            retry_interval,
        }
    }

    async fn attempt(&self, id: &LockIdentifier, holder: &HolderId, lease: Option<Duration>) -> Result<bool> {
        let attempt = Attempt {
            id,
            holder,
            lease_ms: lease.map_or(0, duration_ms),
            now_ms: self.clock.now_millis(),
        };
        Ok(self.protocol.acquire(self.store.as_ref(), attempt).await?)
    }

    fn acquired(&self, id: &LockIdentifier, holder: &HolderId, started: Instant) {
        let kind = self.protocol.kind().as_str();
        LockMetrics::record_acquired(kind, started.elapsed());
        tracing::debug!(lock_id = %id, holder = %holder, kind, "Lock acquired");
    }
}

#[async_trait]
impl<P: LockProtocol> Locker for ScriptLocker<P> {
    fn kind(&self) -> LockKind {
        self.protocol.kind()
    }

    async fn try_lock(
        &self,
        id: &LockIdentifier,
        holder: &HolderId,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<bool> {
        let started = Instant::now();
        let deadline = started + wait;

        loop {
            if self.attempt(id, holder, lease).await? {
                self.acquired(id, holder, started);
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                self.protocol.abandon(self.store.as_ref(), id, holder).await?;
                LockMetrics::record_timeout(self.protocol.kind().as_str());
                tracing::debug!(
                    lock_id = %id,
                    holder = %holder,
                    wait_ms = wait.as_millis(),
                    "Lock wait timed out"
                );
                return Ok(false);
            }

            tokio::time::sleep(jittered(self.retry_interval).min(deadline - now)).await;
        }
    }

    async fn lock(&self, id: &LockIdentifier, holder: &HolderId, lease: Option<Duration>) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.attempt(id, holder, lease).await? {
                self.acquired(id, holder, started);
                return Ok(());
            }
            tokio::time::sleep(jittered(self.retry_interval)).await;
        }
    }

    async fn unlock(&self, id: &LockIdentifier, holder: &HolderId) -> Result<()> {
        let script = HolderRelease;
        let remaining = self
            .store
            .eval(&script, &[id.as_str().to_string()], &[holder.as_str().to_string()])
            .await?
            .expect_int(script.name())?;

        let kind = self.protocol.kind().as_str();
        match remaining {
            -1 => {
                LockMetrics::record_misuse(kind);
                tracing::warn!(lock_id = %id, holder = %holder, kind, "Unlock by non-holder");
                Err(LockError::NotHeld {
                    lock_id: id.to_string(),
                    holder: holder.to_string(),
                })
            }
            0 => {
                LockMetrics::record_released(kind);
                tracing::debug!(lock_id = %id, holder = %holder, kind, "Lock released");
                Ok(())
            }
            count => {
                tracing::trace!(lock_id = %id, holder = %holder, remaining = count, "Re-entry released");
                Ok(())
            }
        }
    }

    async fn is_locked(&self, id: &LockIdentifier) -> Result<bool> {
        let script = KeyExists;
        let exists = self
            .store
            .eval(&script, &[id.as_str().to_string()], &[])
            .await?
            .expect_int(script.name())?;
        Ok(exists == 1)
    }

    async fn force_unlock(&self, id: &LockIdentifier) -> Result<bool> {
        let mut keys = self.protocol.keys(id).into_iter();
        let Some(lock_key) = keys.next() else {
            return Ok(false);
        };
        let held = self.store.delete(&lock_key).await?;
        for key in keys {
            self.store.delete(&key).await?;
        }
        tracing::info!(lock_id = %id, held, "Lock force-released");
        Ok(held)
    }
}
