//! Error types for lock operations.

use seatlock_core::StoreError;
use thiserror::Error;

/// Result type alias for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// Lock failures.
///
/// A contended lock is not an error: `try_lock` returns `Ok(false)` when its
/// wait runs out. [`LockError::Timeout`] is only produced where a caller
/// asked for a timeout to fail (the `Fail` policy, local lock waits).
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be obtained within its wait budget.
    #[error("Timed out waiting for lock `{lock_id}`")]
    Timeout {
        /// Lock that was contended
        lock_id: String,
    },

    /// Unlock by a holder that does not hold the lock.
    #[error("Lock `{lock_id}` is not held by `{holder}`")]
    NotHeld {
        /// Lock identifier
        lock_id: String,
        /// Holder that attempted the release
        holder: String,
    },

    /// Unresolvable key expression, unknown lock kind or resolver, and
    /// other set-up mistakes.
    #[error("Lock configuration error: {0}")]
    Configuration(String),

    /// The shared store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockError {
    /// `true` for [`LockError::Timeout`].
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// `true` for caller misuse ([`LockError::NotHeld`]).
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(self, Self::NotHeld { .. })
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
