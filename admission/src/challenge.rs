//! Challenge trigger after repeated failures.

use crate::decision::{to_count, ChallengeDecision, Gate};
use crate::error::{GateError, Result};
use async_trait::async_trait;
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{duration_ms, int_arg, key_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::{AdmissionConfig, Result as StoreResult, StoreError};
use seatlock_runtime::metrics::GateMetrics;
use std::sync::Arc;
use std::time::Duration;

const CHECK_LUA: &str = r"
local failures = tonumber(redis.call('get', KEYS[1]) or '0')
local required = 0
if failures >= tonumber(ARGV[1]) then
  required = 1
end
return {required, failures}
";

/// KEYS: failure counter. ARGV: threshold. Replies `{required, failures}`.
struct ChallengeCheck;

impl AtomicScript for ChallengeCheck {
    fn name(&self) -> &'static str {
        "seatlock_challenge_check"
    }

    fn source(&self) -> &'static str {
        CHECK_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let threshold = int_arg(self.name(), args, 0)?;
        let failures = match space.get(key)? {
            Some(raw) => raw.parse().map_err(|_| StoreError::Script {
                script: self.name().to_string(),
                reason: format!("failure counter `{raw}` is not a number"),
            })?,
            None => 0,
        };
        Ok(reply(failures, threshold))
    }
}

const FAILURE_LUA: &str = r"
local failures = redis.call('incr', KEYS[1])
redis.call('pexpire', KEYS[1], ARGV[2])
local required = 0
if failures >= tonumber(ARGV[1]) then
  required = 1
end
return {required, failures}
";

/// KEYS: failure counter. ARGV: threshold, memory ms. Every failure
/// restarts the memory window.
struct RecordFailure;

impl AtomicScript for RecordFailure {
    fn name(&self) -> &'static str {
        "seatlock_challenge_failure"
    }

    fn source(&self) -> &'static str {
        FAILURE_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let threshold = int_arg(self.name(), args, 0)?;
        let memory_ms = int_arg(self.name(), args, 1)?;

        let failures = space.incr_by(key, 1)?;
        space.pexpire(key, memory_ms);
        Ok(reply(failures, threshold))
    }
}

fn reply(failures: i64, threshold: i64) -> ScriptValue {
    ScriptValue::Array(vec![
        ScriptValue::Int(i64::from(failures >= threshold)),
        ScriptValue::Int(failures),
    ])
}

/// Demands a human-verification challenge once a client has failed an
/// action often enough, independently of the rate gate.
///
/// Failures are reported with [`ChallengeGate::record_failure`] and
/// forgotten after the memory window, or at once with
/// [`ChallengeGate::clear`] when the client succeeds.
pub struct ChallengeGate {
    store: Arc<dyn SharedStore>,
    prefix: String,
    threshold: u32,
    memory: Duration,
}

impl std::fmt::Debug for ChallengeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeGate")
            .field("prefix", &self.prefix)
            .field("threshold", &self.threshold)
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl ChallengeGate {
    /// Require a challenge after `threshold` failures remembered for
    /// `memory`.
    ///
    /// # Errors
    ///
    /// Returns [`GateError::Configuration`] for a zero threshold or memory.
    pub fn new(
        store: Arc<dyn SharedStore>,
        prefix: impl Into<String>,
        threshold: u32,
        memory: Duration,
    ) -> Result<Self> {
        if threshold == 0 {
            return Err(GateError::Configuration("challenge threshold must be at least 1".to_string()));
        }
        if memory.as_millis() == 0 {
            return Err(GateError::Configuration("challenge window must be at least 1ms".to_string()));
        }
        Ok(Self {
            store,
            prefix: prefix.into(),
            threshold,
            memory,
        })
    }

    /// Build from the admission section of the configuration.
    ///
    /// # Errors
    ///
    /// See [`ChallengeGate::new`].
    pub fn from_config(store: Arc<dyn SharedStore>, prefix: impl Into<String>, config: &AdmissionConfig) -> Result<Self> {
        Self::new(store, prefix, config.challenge_threshold, config.challenge_window)
    }

    /// Count a failed attempt and return the resulting decision.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn record_failure(&self, client: &str, action: &str) -> Result<ChallengeDecision> {
        let script = RecordFailure;
        let reply = self
            .store
            .eval(
                &script,
                &[self.key(client, action)],
                &[self.threshold.to_string(), duration_ms(self.memory).to_string()],
            )
            .await?;
        let decision = decode(script.name(), reply)?;
        tracing::debug!(client = %client, action = %action, failures = decision.failures, "Failure recorded");
        Ok(decision)
    }

    /// Forget the client's failures for `action`.
    ///
    /// # Errors
    ///
    /// Returns a store error.
    pub async fn clear(&self, client: &str, action: &str) -> Result<()> {
        self.store.delete(&self.key(client, action)).await?;
        Ok(())
    }

    fn key(&self, client: &str, action: &str) -> String {
        format!("{}:challenge:{action}:{client}", self.prefix)
    }
}

#[async_trait]
impl Gate for ChallengeGate {
    type Decision = ChallengeDecision;

    fn name(&self) -> &'static str {
        "challenge"
    }

    async fn evaluate(&self, client: &str, action: &str) -> Result<ChallengeDecision> {
        let script = ChallengeCheck;
        let reply = self
            .store
            .eval(&script, &[self.key(client, action)], &[self.threshold.to_string()])
            .await?;
        let decision = decode(script.name(), reply)?;

        GateMetrics::record_decision(self.name(), decision.verdict().as_str());
        if decision.require_challenge {
            tracing::info!(client = %client, action = %action, failures = decision.failures, "Challenge required");
        }
        Ok(decision)
    }
}

fn decode(script: &str, reply: ScriptValue) -> Result<ChallengeDecision> {
    match reply.into_array().as_deref() {
        Some([required, failures]) => Ok(ChallengeDecision {
            require_challenge: required.expect_int(script)? == 1,
            failures: to_count(failures.expect_int(script)?),
        }),
        _ => Err(StoreError::Protocol(format!("script `{script}`: expected two values")).into()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use seatlock_core::InMemoryStore;
    use seatlock_testing::mocks::test_clock;

    #[tokio::test]
    async fn test_challenge_after_threshold_failures() {
        let gate = ChallengeGate::new(Arc::new(InMemoryStore::new()), "t", 3, Duration::from_secs(600)).unwrap();

        assert_eq!(
            gate.evaluate("c-1", "pay").await.unwrap(),
            ChallengeDecision { require_challenge: false, failures: 0 }
        );
        gate.record_failure("c-1", "pay").await.unwrap();
        gate.record_failure("c-1", "pay").await.unwrap();
        assert!(!gate.evaluate("c-1", "pay").await.unwrap().require_challenge);

        let third = gate.record_failure("c-1", "pay").await.unwrap();
        assert!(third.require_challenge);
        assert_eq!(gate.evaluate("c-1", "pay").await.unwrap().failures, 3);
        assert!(!gate.evaluate("c-2", "pay").await.unwrap().require_challenge);
    }

    #[tokio::test]
    async fn test_clear_and_memory_window() {
        let clock = test_clock();
        let store = InMemoryStore::with_clock(clock.shared());
        let gate = ChallengeGate::new(Arc::new(store), "t", 1, Duration::from_secs(600)).unwrap();

        gate.record_failure("c-1", "login").await.unwrap();
        assert!(gate.evaluate("c-1", "login").await.unwrap().require_challenge);
        gate.clear("c-1", "login").await.unwrap();
        assert!(!gate.evaluate("c-1", "login").await.unwrap().require_challenge);

        gate.record_failure("c-1", "login").await.unwrap();
        clock.advance(Duration::from_secs(601));
        assert_eq!(gate.evaluate("c-1", "login").await.unwrap().failures, 0);
    }
}
