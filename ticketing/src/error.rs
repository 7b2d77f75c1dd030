//! Booking errors.
//!
//! Lower layers report contention as values and infrastructure trouble as
//! errors. Both end up here, where they are sorted into what a client can
//! fix (bad input, sold out) and what it should simply retry later.

use seatlock_admission::GateError;
use seatlock_core::{ConfigError, StoreError};
use seatlock_delay::DelayError;
use seatlock_locks::LockError;
use thiserror::Error;

/// Result type alias for booking operations.
pub type Result<T> = std::result::Result<T, BookingError>;

/// Booking failures.
#[derive(Debug, Error)]
pub enum BookingError {
    /// Too many requests from this client in the current window.
    #[error("Too many requests ({count} in the current window)")]
    RateLimited {
        /// Requests counted in the window, this one included
        count: u64,
    },

    /// The client must pass a verification challenge first.
    #[error("Verification required after {failures} failed payments")]
    ChallengeRequired {
        /// Failures remembered for the client
        failures: u64,
    },

    /// The same request is already being processed.
    #[error("An identical request was submitted moments ago")]
    DuplicateSubmission,

    /// The show's inventory stayed locked for the whole wait.
    #[error("Show `{show}` is busy, try again shortly")]
    Busy {
        /// Contended show
        show: String,
    },

    /// Not enough seats left.
    #[error("Show `{show}` has {available} seats left, {requested} requested")]
    SoldOut {
        /// Show
        show: String,
        /// Seats requested
        requested: u32,
        /// Seats left
        available: u32,
    },

    /// The request is malformed.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No such reservation for this client.
    #[error("Reservation `{0}` not found")]
    NotFound(String),

    /// The payment window closed.
    #[error("Reservation `{reservation}` has expired")]
    Expired {
        /// Reservation id
        reservation: String,
    },

    /// The payment was declined.
    #[error("Payment declined ({failures} recent failures)")]
    PaymentDeclined {
        /// Failures remembered for the client, this one included
        failures: u64,
    },

    /// Lock failure.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Admission gate could not decide.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// Delay dispatcher failure.
    #[error(transparent)]
    Delay(#[from] DelayError),

    /// Shared store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Stored data could not be (de)serialised.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BookingError {
    /// `true` when the same request may succeed if sent again later.
    ///
    /// # Examples
    ///
    /// ```
    /// use seatlock_ticketing::BookingError;
    ///
    /// assert!(BookingError::Busy { show: "s-1".into() }.is_retry_later());
    /// assert!(!BookingError::InvalidRequest("no seats".into()).is_retry_later());
    /// ```
    #[must_use]
    pub const fn is_retry_later(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Busy { .. } | Self::DuplicateSubmission | Self::Gate(_) => true,
            Self::Lock(error) => error.is_timeout() || matches!(error, LockError::Store(_)),
            Self::Store(error) | Self::Delay(DelayError::Store(error)) => error.is_transient(),
            _ => false,
        }
    }
}
