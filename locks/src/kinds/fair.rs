use super::{Attempt, LockKind, LockProtocol};
use crate::locker::HolderId;
use crate::naming::LockIdentifier;
use async_trait::async_trait;
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{int_arg, key_arg, text_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::Result as StoreResult;

const ACQUIRE_LUA: &str = r"
local now = tonumber(ARGV[4])
while true do
  local first = redis.call('lindex', KEYS[2], 0)
  if first == false then break end
  local deadline = redis.call('zscore', KEYS[3], first)
  if deadline ~= false and tonumber(deadline) > now then break end
  redis.call('lpop', KEYS[2])
  redis.call('zrem', KEYS[3], first)
end

local lease = tonumber(ARGV[2])
if redis.call('hexists', KEYS[1], ARGV[1]) == 1 then
  redis.call('hincrby', KEYS[1], ARGV[1], 1)
  if lease > 0 then redis.call('pexpire', KEYS[1], lease) end
  return 1
end

local head = redis.call('lindex', KEYS[2], 0)
if redis.call('exists', KEYS[1]) == 0 and (head == false or head == ARGV[1]) then
  if head == ARGV[1] then redis.call('lpop', KEYS[2]) end
  redis.call('zrem', KEYS[3], ARGV[1])
  redis.call('hset', KEYS[1], ARGV[1], 1)
  if lease > 0 then redis.call('pexpire', KEYS[1], lease) end
  return 1
end

if redis.call('zscore', KEYS[3], ARGV[1]) == false then
  redis.call('rpush', KEYS[2], ARGV[1])
end
redis.call('zadd', KEYS[3], now + tonumber(ARGV[3]), ARGV[1])
return 0
";

const CANCEL_LUA: &str = r"
redis.call('lrem', KEYS[1], 0, ARGV[1])
redis.call('zrem', KEYS[2], ARGV[1])
return 1
";

/// KEYS: lock, queue, waiter deadlines. ARGV: holder, lease ms, waiter ttl
/// ms, now ms.
///
/// Waiters whose deadline passed are pruned from the head of the queue;
/// every unsuccessful attempt pushes the caller's deadline forward.
pub(crate) struct FairAcquire;

impl AtomicScript for FairAcquire {
    fn name(&self) -> &'static str {
        "seatlock_fair_acquire"
    }

    fn source(&self) -> &'static str {
        ACQUIRE_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let lock = key_arg(self.name(), keys, 0)?;
        let queue = key_arg(self.name(), keys, 1)?;
        let deadlines = key_arg(self.name(), keys, 2)?;
        let holder = text_arg(self.name(), args, 0)?;
        let lease_ms = int_arg(self.name(), args, 1)?;
        let waiter_ttl_ms = int_arg(self.name(), args, 2)?;
        let now_ms = int_arg(self.name(), args, 3)?;

        while let Some(first) = space.lindex(queue, 0)? {
            if space.zscore(deadlines, &first)?.is_some_and(|deadline| deadline > now_ms) {
                break;
            }
            space.lpop(queue)?;
            space.zrem(deadlines, &first)?;
        }

        if space.hexists(lock, holder)? {
            space.hincr_by(lock, holder, 1)?;
            if lease_ms > 0 {
                space.pexpire(lock, lease_ms);
            }
            return Ok(ScriptValue::Int(1));
        }

        let head = space.lindex(queue, 0)?;
        let is_head = head.as_deref() == Some(holder);
        if !space.exists(lock) && (head.is_none() || is_head) {
            if is_head {
                space.lpop(queue)?;
            }
            space.zrem(deadlines, holder)?;
            space.hset(lock, holder, "1")?;
            if lease_ms > 0 {
                space.pexpire(lock, lease_ms);
            }
            return Ok(ScriptValue::Int(1));
        }

        if space.zscore(deadlines, holder)?.is_none() {
            space.rpush(queue, holder)?;
        }
        space.zadd(deadlines, now_ms.saturating_add(waiter_ttl_ms), holder)?;
        Ok(ScriptValue::Int(0))
    }
}

/// KEYS: queue, waiter deadlines. ARGV: holder.
pub(crate) struct FairCancel;

impl AtomicScript for FairCancel {
    fn name(&self) -> &'static str {
        "seatlock_fair_cancel"
    }

    fn source(&self) -> &'static str {
        CANCEL_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let queue = key_arg(self.name(), keys, 0)?;
        let deadlines = key_arg(self.name(), keys, 1)?;
        let holder = text_arg(self.name(), args, 0)?;
        space.lrem(queue, holder)?;
        space.zrem(deadlines, holder)?;
        Ok(ScriptValue::Int(1))
    }
}

#[derive(Debug)]
pub(crate) struct FairProtocol {
    waiter_ttl_ms: i64,
}

impl FairProtocol {
    pub(crate) const fn new(waiter_ttl_ms: i64) -> Self {
        Self { waiter_ttl_ms }
    }

    fn queue_key(id: &LockIdentifier) -> String {
        id.derived("queue")
    }

    fn deadlines_key(id: &LockIdentifier) -> String {
        id.derived("timeouts")
    }
}

#[async_trait]
impl LockProtocol for FairProtocol {
    fn kind(&self) -> LockKind {
        LockKind::Fair
    }

    async fn acquire(&self, store: &dyn SharedStore, attempt: Attempt<'_>) -> StoreResult<bool> {
        let script = FairAcquire;
        let reply = store
            .eval(
                &script,
                &self.keys(attempt.id),
                &[
                    attempt.holder.as_str().to_string(),
                    attempt.lease_ms.to_string(),
                    self.waiter_ttl_ms.to_string(),
                    attempt.now_ms.to_string(),
                ],
            )
            .await?;
        Ok(reply.expect_int(script.name())? == 1)
    }

    async fn abandon(
        &self,
        store: &dyn SharedStore,
        id: &LockIdentifier,
        holder: &HolderId,
    ) -> StoreResult<()> {
        store
            .eval(
                &FairCancel,
                &[Self::queue_key(id), Self::deadlines_key(id)],
                &[holder.as_str().to_string()],
            )
            .await?;
        Ok(())
    }

    fn keys(&self, id: &LockIdentifier) -> Vec<String> {
        vec![id.as_str().to_string(), Self::queue_key(id), Self::deadlines_key(id)]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const KEYS: [&str; 3] = ["lock", "lock:queue", "lock:timeouts"];

    fn acquire(space: &mut KeySpace, holder: &str, now_ms: i64) -> bool {
        let keys: Vec<String> = KEYS.iter().map(ToString::to_string).collect();
        let args = vec![holder.to_string(), "0".to_string(), "1000".to_string(), now_ms.to_string()];
        FairAcquire.apply(space, &keys, &args).unwrap() == ScriptValue::Int(1)
    }

    #[test]
    fn test_script_keys_share_one_hash_tag() {
        let keys = FairProtocol::new(1_000).keys(&LockIdentifier::new("prod-SERVICE_LOCK-pay-9"));
        assert_eq!(
            keys,
            vec![
                "prod-SERVICE_LOCK-pay-9".to_string(),
                "{prod-SERVICE_LOCK-pay-9}:queue".to_string(),
                "{prod-SERVICE_LOCK-pay-9}:timeouts".to_string(),
            ]
        );
    }

    #[test]
    fn test_free_lock_goes_to_queue_head() {
        let mut space = KeySpace::new();
        assert!(acquire(&mut space, "h1", 0));
        assert!(!acquire(&mut space, "h2", 10));
        assert!(!acquire(&mut space, "h3", 20));
        assert_eq!(space.llen("lock:queue").unwrap(), 2);

        space.del("lock");
        assert!(!acquire(&mut space, "h3", 30));
        assert!(acquire(&mut space, "h2", 40));
        assert_eq!(space.lindex("lock:queue", 0).unwrap().as_deref(), Some("h3"));
    }

    #[test]
    fn test_stale_waiters_pruned() {
        let mut space = KeySpace::new();
        assert!(acquire(&mut space, "h1", 0));
        assert!(!acquire(&mut space, "h2", 0));
        assert!(!acquire(&mut space, "h3", 500));
        space.del("lock");

        // h2 stopped polling at 0 and expired at 1000.
        assert!(acquire(&mut space, "h3", 1_200));
        assert!(!space.exists("lock:queue"));
        assert!(!space.exists("lock:timeouts"));
    }

    #[test]
    fn test_cancel_leaves_queue() {
        let mut space = KeySpace::new();
        assert!(acquire(&mut space, "h1", 0));
        assert!(!acquire(&mut space, "h2", 0));
        FairCancel
            .apply(&mut space, &[KEYS[1].to_string(), KEYS[2].to_string()], &["h2".to_string()])
            .unwrap();
        assert_eq!(space.llen("lock:queue").unwrap(), 0);
        assert_eq!(space.zcard("lock:timeouts").unwrap(), 0);
    }
}
