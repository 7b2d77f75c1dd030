//! Error types for delayed dispatch.

use seatlock_core::StoreError;
use thiserror::Error;

/// Result type alias for delayed dispatch.
pub type Result<T> = std::result::Result<T, DelayError>;

/// Delayed dispatch failures.
#[derive(Debug, Error)]
pub enum DelayError {
    /// The shared store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The store records a different partition count for the topic than
    /// this producer or dispatcher was built with.
    #[error("Topic `{topic}` has {found} partitions in the store, configured for {expected}")]
    PartitionMismatch {
        /// Topic name
        topic: String,
        /// Partition count of this instance
        expected: usize,
        /// Partition count recorded in the store
        found: usize,
    },

    /// Invalid set-up, such as zero partitions or a topic registered twice.
    #[error("Delay configuration error: {0}")]
    Configuration(String),

    /// A handler failed to process a message.
    #[error("Handler for topic `{topic}` failed: {reason}")]
    Handler {
        /// Topic name
        topic: String,
        /// Failure description
        reason: String,
    },

    /// A payload or envelope could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DelayError {
    /// Build a [`DelayError::Handler`] from any displayable failure.
    pub fn handler(topic: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Handler {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
