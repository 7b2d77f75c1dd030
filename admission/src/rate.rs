//! Fixed-window request rate gate.

use crate::decision::{to_count, Gate, RateDecision};
use crate::error::{GateError, Result};
use async_trait::async_trait;
use seatlock_core::environment::{Clock, SystemClock};
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{duration_ms, int_arg, key_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::{AdmissionConfig, Result as StoreResult, StoreError};
use seatlock_runtime::metrics::GateMetrics;
use std::sync::Arc;
use std::time::Duration;

const RATE_LUA: &str = r"
local count = redis.call('incr', KEYS[1])
if count == 1 then
  redis.call('pexpire', KEYS[1], ARGV[2])
end
local within = 0
if count <= tonumber(ARGV[1]) then
  within = 1
end
return {within, count}
";

/// KEYS: bucket counter. ARGV: threshold, counter ttl ms.
/// Replies `{within, count}`.
struct RateCheck;

impl AtomicScript for RateCheck {
    fn name(&self) -> &'static str {
        "seatlock_rate_check"
    }

    fn source(&self) -> &'static str {
        RATE_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let threshold = int_arg(self.name(), args, 0)?;
        let ttl_ms = int_arg(self.name(), args, 1)?;

        let count = space.incr_by(key, 1)?;
        if count == 1 {
            space.pexpire(key, ttl_ms);
        }
        Ok(ScriptValue::Array(vec![
            ScriptValue::Int(i64::from(count <= threshold)),
            ScriptValue::Int(count),
        ]))
    }
}

/// Counts requests per (client, endpoint) in fixed windows and blocks
/// beyond a threshold.
///
/// The window is chosen from the clock (`now / window`), so every instance
/// sharing the store and a roughly synchronised clock counts into the same
/// bucket. Every evaluation increments, blocked ones included.
///
/// # Example
///
/// ```
/// use seatlock_admission::{Gate, RateGate};
/// use seatlock_core::InMemoryStore;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let gate = RateGate::new(Arc::new(InMemoryStore::new()), "demo", 2, Duration::from_secs(60)).unwrap();
/// assert!(gate.evaluate("c-1", "reserve").await.unwrap().within_limit);
/// assert!(gate.evaluate("c-1", "reserve").await.unwrap().within_limit);
/// assert!(!gate.evaluate("c-1", "reserve").await.unwrap().within_limit);
/// # });
/// ```
pub struct RateGate {
    store: Arc<dyn SharedStore>,
    prefix: String,
    threshold: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGate")
            .field("prefix", &self.prefix)
            .field("threshold", &self.threshold)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl RateGate {
    /// Allow `threshold` requests per `window`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Configuration`] for a zero threshold or a
    /// window under one millisecond.
    pub fn new(
        store: Arc<dyn SharedStore>,
        prefix: impl Into<String>,
        threshold: u32,
        window: Duration,
    ) -> Result<Self> {
        if threshold == 0 {
            return Err(GateError::Configuration("rate threshold must be at least 1".to_string()));
        }
        if window.as_millis() == 0 {
            return Err(GateError::Configuration("rate window must be at least 1ms".to_string()));
        }
        Ok(Self {
            store,
            prefix: prefix.into(),
            threshold,
            window,
            clock: Arc::new(SystemClock),
        })
    }

    /// Build from the admission section of the configuration.
    ///
    /// # Errors
    ///
    /// See [`RateGate::new`].
    pub fn from_config(store: Arc<dyn SharedStore>, prefix: impl Into<String>, config: &AdmissionConfig) -> Result<Self> {
        Self::new(store, prefix, config.rate_threshold, config.rate_window)
    }

    /// Use another clock to pick windows.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Requests allowed per window.
    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    fn bucket_key(&self, client: &str, endpoint: &str) -> String {
        let window_ms = duration_ms(self.window).max(1);
        let bucket = self.clock.now_millis().div_euclid(window_ms);
        format!("{}:rate:{endpoint}:{client}:{bucket}", self.prefix)
    }
}

#[async_trait]
impl Gate for RateGate {
    type Decision = RateDecision;

    fn name(&self) -> &'static str {
        "rate"
    }

    async fn evaluate(&self, client: &str, endpoint: &str) -> Result<RateDecision> {
        let script = RateCheck;
        let key = self.bucket_key(client, endpoint);
        // The counter outlives its window so a late straggler cannot
        // restart it at 1.
        let ttl_ms = duration_ms(self.window).saturating_mul(2);
        let reply = self
            .store
            .eval(&script, &[key], &[self.threshold.to_string(), ttl_ms.to_string()])
            .await?;

        let decision = match reply.into_array().as_deref() {
            Some([within, count]) => RateDecision {
                within_limit: within.expect_int(script.name())? == 1,
                current_count: to_count(count.expect_int(script.name())?),
            },
            _ => {
                return Err(StoreError::Protocol(format!("script `{}`: expected two values", script.name())).into());
            }
        };

        GateMetrics::record_decision(self.name(), decision.verdict().as_str());
        if !decision.within_limit {
            tracing::info!(
                client = %client,
                endpoint = %endpoint,
                count = decision.current_count,
                threshold = self.threshold,
                "Rate limit exceeded"
            );
        }
        Ok(decision)
    }
}
