//! Run a unit of work while a cluster lock is held.
//!
//! [`ServiceLock::execute`] resolves the lock identifier from the call's
//! arguments, waits for the lock, runs the work and releases the lock
//! exactly once afterwards, whether the work returned `Ok`, `Err` or
//! panicked. When the wait runs out, the options' [`TimeoutPolicy`]
//! decides what happens instead.
//!
//! A lease shorter than the work leaves the remainder of the work running
//! without the lock; the release at the end then reports the lock as not
//! held and is only logged.
//!
//! # Example
//!
//! ```
//! use seatlock_core::{InMemoryStore, LockSettings};
//! use seatlock_locks::{CallArgs, LockError, LockManager, LockOptions, ResolverRegistry, ServiceLock, TimeoutPolicy};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let manager = Arc::new(LockManager::new(Arc::new(InMemoryStore::new()), LockSettings::default()));
//! let service = ServiceLock::new(manager, Arc::new(ResolverRegistry::with_builtins("demo")));
//!
//! let options = LockOptions::new("reserve")
//!     .keys(["#show"])
//!     .wait(Duration::from_millis(100))
//!     .on_timeout(TimeoutPolicy::Fail);
//! let call = CallArgs::new().with("show", 42);
//!
//! let seats = service
//!     .execute(&options, &call, 2_u32, |wanted| async move { Ok::<_, LockError>(wanted) })
//!     .await
//!     .unwrap();
//! assert_eq!(seats, 2);
//! # });
//! ```

use crate::error::LockError;
use crate::expression::CallArgs;
use crate::kinds::LockKind;
use crate::locker::{HolderId, Locker};
use crate::manager::LockManager;
use crate::naming::{LockIdentifier, ResolverRegistry, SERVICE_LOCK};
use futures::future::BoxFuture;
use futures::FutureExt;
use seatlock_runtime::metrics::LockMetrics;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

/// Fallback invoked with the arguments the work would have received.
pub type FallbackFn<A, T, E> = Arc<dyn Fn(A) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// What to do when the lock cannot be obtained in time.
pub enum TimeoutPolicy<A, T, E> {
    /// Return [`LockError::Timeout`]; the work never runs.
    Fail,
    /// Call the fallback with the same arguments.
    Fallback(FallbackFn<A, T, E>),
    /// Run the work anyway, once, without the lock.
    Continue,
}

impl<A, T, E> TimeoutPolicy<A, T, E> {
    /// Build a [`TimeoutPolicy::Fallback`] from an async closure.
    pub fn fallback<F, Fut>(fallback: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self::Fallback(Arc::new(move |args| fallback(args).boxed()))
    }

    const fn label(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::Fallback(_) => "fallback",
            Self::Continue => "continue",
        }
    }
}

impl<A, T, E> Clone for TimeoutPolicy<A, T, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Fail => Self::Fail,
            Self::Fallback(fallback) => Self::Fallback(Arc::clone(fallback)),
            Self::Continue => Self::Continue,
        }
    }
}

impl<A, T, E> fmt::Debug for TimeoutPolicy<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lock settings for one call site.
pub struct LockOptions<A, T, E> {
    name: String,
    keys: Vec<String>,
    kind: LockKind,
    wait: Option<Duration>,
    lease: Option<Duration>,
    resolver: String,
    policy: TimeoutPolicy<A, T, E>,
}

impl<A, T, E> Clone for LockOptions<A, T, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            keys: self.keys.clone(),
            kind: self.kind,
            wait: self.wait,
            lease: self.lease,
            resolver: self.resolver.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<A, T, E> fmt::Debug for LockOptions<A, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockOptions")
            .field("name", &self.name)
            .field("keys", &self.keys)
            .field("kind", &self.kind)
            .field("wait", &self.wait)
            .field("lease", &self.lease)
            .field("resolver", &self.resolver)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<A, T, E> LockOptions<A, T, E> {
    /// Options for business name `name`: reentrant, manager defaults for
    /// wait and lease, [`TimeoutPolicy::Fail`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            kind: LockKind::default(),
            wait: None,
            lease: None,
            resolver: SERVICE_LOCK.to_string(),
            policy: TimeoutPolicy::Fail,
        }
    }

    /// Key expressions (`#param.field[0]`) evaluated against the call.
    #[must_use]
    pub fn keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Lock kind.
    #[must_use]
    pub const fn kind(mut self, kind: LockKind) -> Self {
        self.kind = kind;
        self
    }

    /// Wait budget.
    #[must_use]
    pub const fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    /// Lease after which the lock expires on its own.
    #[must_use]
    pub const fn lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }

    /// Resolver used to name the lock.
    #[must_use]
    pub fn resolver(mut self, resolver: impl Into<String>) -> Self {
        self.resolver = resolver.into();
        self
    }

    /// Timeout policy.
    #[must_use]
    pub fn on_timeout(mut self, policy: TimeoutPolicy<A, T, E>) -> Self {
        self.policy = policy;
        self
    }
}

/// Higher-order lock wrapper.
#[derive(Debug, Clone)]
pub struct ServiceLock {
    manager: Arc<LockManager>,
    resolvers: Arc<ResolverRegistry>,
}

impl ServiceLock {
    /// Create the wrapper.
    #[must_use]
    pub const fn new(manager: Arc<LockManager>, resolvers: Arc<ResolverRegistry>) -> Self {
        Self { manager, resolvers }
    }

    /// Run `work(args)` under the lock named by `options` and `call`, as a
    /// fresh holder.
    ///
    /// # Errors
    ///
    /// Returns the work's (or fallback's) error, or a [`LockError`]
    /// converted into `E`: configuration problems, store failures, and
    /// [`LockError::Timeout`] under [`TimeoutPolicy::Fail`].
    pub async fn execute<A, T, E, W, Fut>(
        &self,
        options: &LockOptions<A, T, E>,
        call: &CallArgs,
        args: A,
        work: W,
    ) -> Result<T, E>
    where
        W: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        self.execute_as(options, &HolderId::new(), call, args, work).await
    }

    /// Like [`ServiceLock::execute`] but as `holder`, so nested calls by
    /// the same holder re-enter instead of waiting on themselves.
    ///
    /// # Errors
    ///
    /// See [`ServiceLock::execute`].
    pub async fn execute_as<A, T, E, W, Fut>(
        &self,
        options: &LockOptions<A, T, E>,
        holder: &HolderId,
        call: &CallArgs,
        args: A,
        work: W,
    ) -> Result<T, E>
    where
        W: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let resolver = self.resolvers.get(&options.resolver)?;
        let id = resolver.resolve_call(&options.name, &options.keys, call)?;
        let locker = self.manager.get(options.kind);
        let settings = self.manager.settings();
        let wait = options.wait.unwrap_or(settings.wait_time);
        let lease = options.lease.or(settings.lease_time);

        if !locker.try_lock(&id, holder, wait, lease).await? {
            return Self::on_timeout(options, &id, args, work).await;
        }

        let outcome = AssertUnwindSafe(work(args)).catch_unwind().await;
        Self::release(locker.as_ref(), &id, holder).await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn on_timeout<A, T, E, W, Fut>(
        options: &LockOptions<A, T, E>,
        id: &LockIdentifier,
        args: A,
        work: W,
    ) -> Result<T, E>
    where
        W: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        LockMetrics::record_fallback(options.policy.label());
        match &options.policy {
            TimeoutPolicy::Fail => {
                tracing::info!(lock_id = %id, "Lock wait timed out, failing call");
                Err(LockError::Timeout { lock_id: id.to_string() }.into())
            }
            TimeoutPolicy::Fallback(fallback) => {
                tracing::info!(lock_id = %id, "Lock wait timed out, running fallback");
                fallback(args).await
            }
            TimeoutPolicy::Continue => {
                tracing::warn!(lock_id = %id, "Lock wait timed out, continuing without lock");
                work(args).await
            }
        }
    }

    async fn release(locker: &dyn Locker, id: &LockIdentifier, holder: &HolderId) {
        match locker.unlock(id, holder).await {
            Ok(()) => {}
            Err(LockError::NotHeld { .. }) => {
                tracing::warn!(lock_id = %id, holder = %holder, "Lock lease ran out before the work finished");
            }
            Err(error) => {
                tracing::error!(lock_id = %id, holder = %holder, error = %error, "Failed to release lock");
            }
        }
    }
}
