//! Explicit task context propagation.
//!
//! Trace identifiers and request attributes travel as a [`TaskContext`]
//! value. Whoever submits work hands the context over explicitly; while the
//! work runs the context is also reachable through [`TaskContext::current`]
//! and every log line carries its trace id through a tracing span. When the
//! work completes the previous context (if any) is back in effect, whether
//! the work ran inline or on another worker.
//!
//! ```rust
//! use seatlock_runtime::context::{spawn_with_context, TaskContext};
//!
//! # async fn example() {
//! let ctx = TaskContext::new().with_attribute("client", "c-42");
//! let handle = spawn_with_context(ctx, |ctx| async move {
//!     assert_eq!(ctx.attribute("client"), Some("c-42"));
//!     TaskContext::current().map(|current| current.trace_id().to_string())
//! });
//! assert!(handle.await.unwrap().is_some());
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument, Span};
use uuid::Uuid;

tokio::task_local! {
    static CURRENT: TaskContext;
}

/// Trace id plus free-form attributes for one logical unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    trace_id: String,
    attributes: BTreeMap<String, String>,
}

impl TaskContext {
    /// Fresh context with a random trace id.
    #[must_use]
    pub fn new() -> Self {
        Self::with_trace_id(Uuid::new_v4().to_string())
    }

    /// Context with a known trace id (e.g. restored from a message).
    #[must_use]
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Trace id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Look up an attribute.
    #[must_use]
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// All attributes.
    #[must_use]
    pub const fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Context of the running task, if it was started inside a scope.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// Context of the running task, or a fresh one.
    #[must_use]
    pub fn current_or_new() -> Self {
        Self::current().unwrap_or_default()
    }

    /// Span carrying the trace id.
    #[must_use]
    pub fn span(&self) -> Span {
        info_span!("task", trace_id = %self.trace_id)
    }

    /// Run `future` with this context installed. The previous context is
    /// restored when the future completes or is dropped.
    pub async fn scope<F>(self, future: F) -> F::Output
    where
        F: Future,
    {
        let span = self.span();
        CURRENT.scope(self, future.instrument(span)).await
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Named executor that spawns every task inside its submitter's context.
///
/// The name shows up on the task span so logs from listener loops and
/// request handlers can be told apart.
#[derive(Debug, Clone, Copy)]
pub struct ContextExecutor {
    name: &'static str,
}

impl ContextExecutor {
    /// Create an executor.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self { name }
    }

    /// Executor name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Spawn `task` with `ctx` handed in and installed for its duration.
    pub fn spawn<F, Fut>(&self, ctx: TaskContext, task: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(TaskContext) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let span = info_span!("executor", executor = self.name);
        let future = task(ctx.clone());
        tokio::spawn(ctx.scope(future).instrument(span))
    }
}

/// Spawn `task` on the runtime with `ctx` passed in and installed.
///
/// The closure receives its own copy of the context so the task body never
/// has to reach for ambient state.
pub fn spawn_with_context<F, Fut>(ctx: TaskContext, task: F) -> JoinHandle<Fut::Output>
where
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let future = task(ctx.clone());
    tokio::spawn(ctx.scope(future))
}
