//! Error types for admission gates.

use seatlock_core::StoreError;
use thiserror::Error;

/// Result type alias for gate evaluations.
pub type Result<T> = std::result::Result<T, GateError>;

/// Gate failures.
///
/// A blocked request is not an error; it is a decision. Errors mean the
/// gate could not decide, and the caller chooses whether to admit or refuse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    /// The shared store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid gate parameters or keys.
    #[error("Gate configuration error: {0}")]
    Configuration(String),
}

impl GateError {
    /// `true` if the store could not be reached.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Store(StoreError::Unavailable(_)))
    }
}
