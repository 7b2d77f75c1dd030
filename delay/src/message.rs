//! Delay items as stored and as delivered.

use crate::error::Result;
use seatlock_runtime::TaskContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// What the store keeps per item besides its schedule: the payload and the
/// producer's task context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Envelope {
    pub(crate) payload: String,
    pub(crate) context: TaskContext,
}

impl Envelope {
    pub(crate) fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// A due item handed to a [`DelayHandler`](crate::DelayHandler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayMessage {
    /// Item id, unique per offer
    pub id: String,
    /// Topic the item was offered to
    pub topic: String,
    /// Partition it was stored in
    pub partition: usize,
    /// Raw payload
    pub payload: String,
    /// Epoch milliseconds before which the item was not eligible
    pub not_before_ms: i64,
    /// Delivery attempt, starting at 1. Higher values mean redelivery.
    pub attempt: u32,
    /// Context of the task that offered the item
    pub context: TaskContext,
}

impl DelayMessage {
    /// Decode the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::Serialization`](crate::DelayError::Serialization)
    /// if the payload is not a valid `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// `true` when this is not the first delivery of the item.
    #[must_use]
    pub const fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// Where and when an offered item was stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayReceipt {
    /// Item id
    pub id: String,
    /// Partition chosen by the selector
    pub partition: usize,
    /// Epoch milliseconds at which the item becomes eligible
    pub not_before_ms: i64,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_keeps_trace_context() {
        let context = TaskContext::with_trace_id("trace-9").with_attribute("order", "o-1");
        let raw = Envelope {
            payload: "cancel o-1".to_string(),
            context: context.clone(),
        }
        .encode()
        .unwrap();

        let envelope = Envelope::decode(&raw).unwrap();
        assert_eq!(envelope.payload, "cancel o-1");
        assert_eq!(envelope.context, context);
    }

    #[test]
    fn test_json_payload_and_redelivery_flag() {
        let message = DelayMessage {
            id: "m-1".to_string(),
            topic: "orders".to_string(),
            partition: 0,
            payload: r#"{"order":7}"#.to_string(),
            not_before_ms: 0,
            attempt: 2,
            context: TaskContext::new(),
        };

        let value: serde_json::Value = message.json().unwrap();
        assert_eq!(value["order"], 7);
        assert!(message.is_redelivery());
        assert!(message.json::<u32>().is_err());
    }
}
