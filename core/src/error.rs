//! Error types for shared-store operations.

use thiserror::Error;

/// Result type alias for shared-store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures reported by a [`SharedStore`](crate::store::SharedStore).
///
/// Lock and gate correctness depends on the store being authoritative, so
/// none of these are swallowed by the layers above; they are wrapped and
/// propagated to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the connection broke mid-call.
    #[error("Shared store unavailable: {0}")]
    Unavailable(String),

    /// A command ran against a key holding a different kind of value.
    #[error("Key `{key}` holds the wrong kind of value")]
    WrongType {
        /// Offending key
        key: String,
    },

    /// An atomic script rejected its input or failed while running.
    #[error("Script `{script}` failed: {reason}")]
    Script {
        /// Script name
        script: String,
        /// Failure reason
        reason: String,
    },

    /// The store answered with a reply the caller could not interpret.
    #[error("Unexpected reply from shared store: {0}")]
    Protocol(String),
}

impl StoreError {
    /// Returns `true` if retrying later may succeed.
    ///
    /// # Examples
    ///
    /// ```
    /// # use seatlock_core::StoreError;
    /// assert!(StoreError::Unavailable("connection refused".into()).is_transient());
    /// assert!(!StoreError::Protocol("bad reply".into()).is_transient());
    /// ```
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
