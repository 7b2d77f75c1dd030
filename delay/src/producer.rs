//! Producer side: offer items with a delay.

use crate::error::Result;
use crate::message::{DelayReceipt, Envelope};
use crate::queue::TopicQueue;
use crate::selector::PartitionSelector;
use seatlock_core::environment::{Clock, SystemClock};
use seatlock_core::store::{duration_ms, SharedStore};
use seatlock_runtime::metrics::DelayMetrics;
use seatlock_runtime::TaskContext;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Offers items to one topic.
///
/// The partition count is checked against the store on the first offer;
/// producers never coordinate with each other otherwise.
///
/// # Example
///
/// ```
/// use seatlock_core::InMemoryStore;
/// use seatlock_delay::DelayProducer;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let producer = DelayProducer::new(Arc::new(InMemoryStore::new()), "demo", "order-cancel", 5).unwrap();
/// let receipt = producer.offer("o-17", Duration::from_secs(900)).await.unwrap();
/// assert!(receipt.partition < 5);
/// # });
/// ```
pub struct DelayProducer {
    queue: TopicQueue,
    selector: PartitionSelector,
    clock: Arc<dyn Clock>,
    verified: OnceCell<()>,
}

impl std::fmt::Debug for DelayProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayProducer")
            .field("queue", &self.queue)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl DelayProducer {
    /// Create a round-robin producer for `topic` with `partitions`.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::Configuration`](crate::DelayError::Configuration)
    /// for an empty topic or zero partitions.
    pub fn new(
        store: Arc<dyn SharedStore>,
        prefix: impl Into<String>,
        topic: impl Into<String>,
        partitions: usize,
    ) -> Result<Self> {
        Ok(Self {
            queue: TopicQueue::new(store, prefix, topic, partitions)?,
            selector: PartitionSelector::default(),
            clock: Arc::new(SystemClock),
            verified: OnceCell::new(),
        })
    }

    /// Use another partition selector.
    #[must_use]
    pub fn with_selector(mut self, selector: PartitionSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Use another clock for not-before timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The topic's store handle, for counters.
    #[must_use]
    pub const fn queue(&self) -> &TopicQueue {
        &self.queue
    }

    /// Store `payload` for delivery once `delay` has elapsed. The current
    /// task context travels with it.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::PartitionMismatch`](crate::DelayError::PartitionMismatch)
    /// on first use if the store records another partition count, or a
    /// store error.
    pub async fn offer(&self, payload: impl Into<String>, delay: Duration) -> Result<DelayReceipt> {
        self.verified
            .get_or_try_init(|| self.queue.verify_partitions())
            .await?;

        let payload = payload.into();
        let partition = self.selector.select(&payload, self.queue.partitions());
        let id = Uuid::new_v4().to_string();
        let not_before_ms = self.clock.now_millis().saturating_add(duration_ms(delay));
        let envelope = Envelope {
            payload,
            context: TaskContext::current_or_new(),
        }
        .encode()?;

        self.queue.push(partition, &id, &envelope, not_before_ms).await?;
        DelayMetrics::record_offer(self.queue.topic());
        tracing::debug!(
            topic = %self.queue.topic(),
            partition,
            id = %id,
            delay_ms = duration_ms(delay),
            "Delay item offered"
        );
        Ok(DelayReceipt {
            id,
            partition,
            not_before_ms,
        })
    }

    /// Serialize `payload` as JSON and offer it.
    ///
    /// # Errors
    ///
    /// As [`DelayProducer::offer`], plus
    /// [`DelayError::Serialization`](crate::DelayError::Serialization).
    pub async fn offer_json<T: Serialize + Sync>(&self, payload: &T, delay: Duration) -> Result<DelayReceipt> {
        let raw = serde_json::to_string(payload)?;
        self.offer(raw, delay).await
    }
}
