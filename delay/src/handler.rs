//! Topic handlers and their registration table.

use crate::error::{DelayError, Result};
use crate::message::DelayMessage;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Processes due items of one topic.
///
/// Returning `Err` is final: the failure is logged and the item is
/// acknowledged. A panic or a handler timeout leaves the item in flight and
/// it is delivered again once its visibility timeout passes, so handlers
/// must tolerate seeing an item more than once.
#[async_trait]
pub trait DelayHandler: Send + Sync {
    /// Topic served by this handler.
    fn topic(&self) -> &str;

    /// Process one message.
    ///
    /// # Errors
    ///
    /// Any [`DelayError`]; it is logged, not retried.
    async fn execute(&self, message: DelayMessage) -> Result<()>;
}

/// Explicit topic → handler table read by the dispatcher.
#[derive(Default, Clone)]
pub struct TopicRegistry {
    handlers: BTreeMap<String, Arc<dyn DelayHandler>>,
}

impl std::fmt::Debug for TopicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicRegistry")
            .field("topics", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TopicRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under its topic.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::Configuration`] if the topic already has a
    /// handler or the topic name is empty.
    pub fn register(mut self, handler: Arc<dyn DelayHandler>) -> Result<Self> {
        let topic = handler.topic().to_string();
        if topic.is_empty() {
            return Err(DelayError::configuration("handler topic must not be empty"));
        }
        if self.handlers.contains_key(&topic) {
            return Err(DelayError::configuration(format!("topic `{topic}` registered twice")));
        }
        self.handlers.insert(topic, handler);
        Ok(self)
    }

    /// Handler for `topic`.
    #[must_use]
    pub fn get(&self, topic: &str) -> Option<Arc<dyn DelayHandler>> {
        self.handlers.get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Number of registered topics.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
