//! # Seatlock Delay
//!
//! Sharded delayed dispatch over the shared store: producers offer items
//! that become eligible after a delay, and a dispatcher delivers them to
//! the topic's handler once due. Used to cancel reservations whose payment
//! did not complete in time.
//!
//! - [`DelayProducer`]: offers items; a [`PartitionSelector`] spreads them
//!   over a topic's partitions
//! - [`DelayDispatcher`]: one listener per (topic, partition), handlers
//!   looked up in a [`TopicRegistry`]
//! - [`TopicQueue`]: store layout, atomic scripts and per-partition counters
//!
//! Delivery is at least once. An item moves through
//!
//! ```text
//! pending ──(not-before passes)──► ready ──(poll)──► delivered ──(ack)──► done
//!                                    ▲                   │
//!                                    └─(visibility timeout, no ack)
//! ```
//!
//! The partition count of a topic is recorded in the store by whoever uses
//! the topic first; a producer or dispatcher configured differently fails
//! with [`DelayError::PartitionMismatch`].

pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod message;
pub mod producer;
pub mod queue;
pub mod selector;

pub use dispatcher::{DelayDispatcher, DispatcherHandle};
pub use error::{DelayError, Result};
pub use handler::{DelayHandler, TopicRegistry};
pub use message::{DelayMessage, DelayReceipt};
pub use producer::DelayProducer;
pub use queue::TopicQueue;
pub use selector::PartitionSelector;
