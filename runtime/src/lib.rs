//! # Seatlock Runtime
//!
//! Execution support shared by the coordination components:
//!
//! - [`context`]: explicit task context propagation across spawned work
//! - [`retry`]: exponential backoff and jittered polling intervals
//! - [`metrics`]: Prometheus metric descriptions and recorders

pub mod context;
pub mod metrics;
pub mod retry;

pub use context::{spawn_with_context, ContextExecutor, TaskContext};
pub use retry::{jittered, RetryPolicy};
