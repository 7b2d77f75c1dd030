//! Partition choice for new items.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks the partition an offered item is stored in.
///
/// Round-robin spreads items evenly regardless of content. Payload hashing
/// sends equal payloads to the same partition, which keeps items about the
/// same order on one listener; it relies on every producer running the same
/// build, since the hash is not stable across compiler versions.
#[derive(Debug)]
pub enum PartitionSelector {
    /// Cycle through `[0, N)`.
    RoundRobin(AtomicUsize),
    /// Hash of the payload modulo `N`.
    PayloadHash,
}

impl Default for PartitionSelector {
    fn default() -> Self {
        Self::round_robin()
    }
}

impl PartitionSelector {
    /// Round-robin selector starting at partition 0.
    #[must_use]
    pub const fn round_robin() -> Self {
        Self::RoundRobin(AtomicUsize::new(0))
    }

    /// Partition in `[0, partitions)` for `payload`. `partitions` must be
    /// non-zero.
    pub fn select(&self, payload: &str, partitions: usize) -> usize {
        let partitions = partitions.max(1);
        match self {
            Self::RoundRobin(next) => next.fetch_add(1, Ordering::Relaxed) % partitions,
            Self::PayloadHash => {
                let mut hasher = DefaultHasher::new();
                payload.hash(&mut hasher);
                #[allow(clippy::cast_possible_truncation)]
                let hash = hasher.finish() as usize;
                hash % partitions
            }
        }
    }
}
