//! Repeat-submission guard.
//!
//! Marks a business operation (say, "client c-7 submits an order for show
//! 42") as in progress for a window. A second submission inside the window
//! is refused instead of queued, which is what a double-clicked "buy"
//! button needs. The marker lives in the shared store, so the guard holds
//! across instances.

use crate::error::Result;
use crate::expression::CallArgs;
use crate::naming::{LockIdentifier, LockInfoResolver, ResolverRegistry, REPEAT_LIMIT};
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{duration_ms, int_arg, key_arg, text_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::Result as StoreResult;
use std::sync::Arc;
use std::time::Duration;

const MARK_LUA: &str = r"
if redis.call('exists', KEYS[1]) == 1 then
  return 0
end
redis.call('set', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
";

/// KEYS: marker. ARGV: owner, ttl ms. `1` if the marker was placed.
struct PlaceMarker;

impl AtomicScript for PlaceMarker {
    fn name(&self) -> &'static str {
        "seatlock_repeat_mark"
    }

    fn source(&self) -> &'static str {
        MARK_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let owner = text_arg(self.name(), args, 0)?;
        let ttl_ms = int_arg(self.name(), args, 1)?;
        if space.exists(key) {
            return Ok(ScriptValue::Int(0));
        }
        space.set(key, owner, Some(ttl_ms));
        Ok(ScriptValue::Int(1))
    }
}

/// Outcome of a submission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// First submission in the window; the marker is now placed.
    Accepted(LockIdentifier),
    /// A marker already exists.
    Repeated(LockIdentifier),
}

impl Submission {
    /// `true` for [`Submission::Accepted`].
    #[must_use]
    pub const fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Marker identifier.
    #[must_use]
    pub const fn identifier(&self) -> &LockIdentifier {
        match self {
            Self::Accepted(id) | Self::Repeated(id) => id,
        }
    }
}

/// Refuses repeated submissions of the same operation within a window.
#[derive(Debug, Clone)]
pub struct RepeatGuard {
    store: Arc<dyn SharedStore>,
    resolver: Arc<dyn LockInfoResolver>,
}

impl RepeatGuard {
    /// Create a guard naming markers with the registry's
    /// [`REPEAT_LIMIT`] resolver.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Configuration`](crate::LockError::Configuration)
    /// if the registry has no such resolver.
    pub fn new(store: Arc<dyn SharedStore>, resolvers: &ResolverRegistry) -> Result<Self> {
        Ok(Self {
            store,
            resolver: resolvers.get(REPEAT_LIMIT)?,
        })
    }

    /// Check and mark a submission identified by explicit key values.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for empty parts, or a store error.
    pub async fn submit(&self, business_name: &str, key_values: &[String], window: Duration) -> Result<Submission> {
        let id = self.resolver.resolve(business_name, key_values)?;
        self.mark(id, window).await
    }

    /// Check and mark a submission identified by key expressions.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unresolvable expressions, or a
    /// store error.
    pub async fn submit_call(
        &self,
        business_name: &str,
        expressions: &[String],
        call: &CallArgs,
        window: Duration,
    ) -> Result<Submission> {
        let id = self.resolver.resolve_call(business_name, expressions, call)?;
        self.mark(id, window).await
    }

    /// Remove a marker before its window ends (the operation failed and may
    /// be retried). Returns `true` if a marker existed.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn clear(&self, id: &LockIdentifier) -> Result<bool> {
        Ok(self.store.delete(id.as_str()).await?)
    }

    async fn mark(&self, id: LockIdentifier, window: Duration) -> Result<Submission> {
        let script = PlaceMarker;
        let placed = self
            .store
            .eval(
                &script,
                &[id.as_str().to_string()],
                &["1".to_string(), duration_ms(window).max(1).to_string()],
            )
            .await?
            .expect_int(script.name())?;

        if placed == 1 {
            Ok(Submission::Accepted(id))
        } else {
            tracing::info!(marker = %id, "Repeated submission refused");
            Ok(Submission::Repeated(id))
        }
    }
}
