use super::{Attempt, LockKind, LockProtocol};
use async_trait::async_trait;
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{int_arg, key_arg, text_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::Result as StoreResult;

const ACQUIRE_LUA: &str = r"
if redis.call('exists', KEYS[1]) == 0 or redis.call('hexists', KEYS[1], ARGV[1]) == 1 then
  redis.call('hincrby', KEYS[1], ARGV[1], 1)
  if tonumber(ARGV[2]) > 0 then
    redis.call('pexpire', KEYS[1], ARGV[2])
  end
  return 1
end
return 0
";

/// KEYS: lock. ARGV: holder, lease ms.
pub(crate) struct ReentrantAcquire;

impl AtomicScript for ReentrantAcquire {
    fn name(&self) -> &'static str {
        "seatlock_reentrant_acquire"
    }

    fn source(&self) -> &'static str {
        ACQUIRE_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let holder = text_arg(self.name(), args, 0)?;
        let lease_ms = int_arg(self.name(), args, 1)?;

        if space.exists(key) && !space.hexists(key, holder)? {
            return Ok(ScriptValue::Int(0));
        }
        space.hincr_by(key, holder, 1)?;
        if lease_ms > 0 {
            space.pexpire(key, lease_ms);
        }
        Ok(ScriptValue::Int(1))
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReentrantProtocol;

#[async_trait]
impl LockProtocol for ReentrantProtocol {
    fn kind(&self) -> LockKind {
        LockKind::Reentrant
    }

    async fn acquire(&self, store: &dyn SharedStore, attempt: Attempt<'_>) -> StoreResult<bool> {
        let script = ReentrantAcquire;
        let reply = store
            .eval(
                &script,
                &[attempt.id.as_str().to_string()],
                &[attempt.holder.as_str().to_string(), attempt.lease_ms.to_string()],
            )
            .await?;
        Ok(reply.expect_int(script.name())? == 1)
    }
}
