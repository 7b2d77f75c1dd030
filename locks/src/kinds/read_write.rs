use super::{Attempt, LockKind, LockProtocol, MODE_FIELD};
use async_trait::async_trait;
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{int_arg, key_arg, text_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::{Result as StoreResult, StoreError};

const READ: &str = "read";
const WRITE: &str = "write";

// A holder re-enters in either mode. A reader asking for write is upgraded
// only while it is the sole holder. A reader's lease only ever lengthens the
// key expiry; a key without expiry keeps none, since some holder asked for
// no lease.
const ACQUIRE_LUA: &str = r"
local mode = redis.call('hget', KEYS[1], '__mode')
if mode == false then
  redis.call('hset', KEYS[1], '__mode', ARGV[3])
  redis.call('hset', KEYS[1], ARGV[1], 1)
  if tonumber(ARGV[2]) > 0 then
    redis.call('pexpire', KEYS[1], ARGV[2])
  end
  return 1
end
local granted = false
if redis.call('hexists', KEYS[1], ARGV[1]) == 1 then
  if mode == 'write' or ARGV[3] == 'read' then
    granted = true
  elseif redis.call('hlen', KEYS[1]) == 2 then
    redis.call('hset', KEYS[1], '__mode', 'write')
    granted = true
  end
elseif mode == 'read' and ARGV[3] == 'read' then
  granted = true
end
if granted then
  redis.call('hincrby', KEYS[1], ARGV[1], 1)
  local lease = tonumber(ARGV[2])
  if lease > 0 then
    local ttl = redis.call('pttl', KEYS[1])
    if ttl >= 0 and ttl < lease then
      redis.call('pexpire', KEYS[1], lease)
    end
  end
  return 1
end
return 0
";

/// KEYS: lock. ARGV: holder, lease ms, `read` | `write`.
pub(crate) struct ReadWriteAcquire;

impl AtomicScript for ReadWriteAcquire {
    fn name(&self) -> &'static str {
        "seatlock_rw_acquire"
    }

    fn source(&self) -> &'static str {
        ACQUIRE_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let holder = text_arg(self.name(), args, 0)?;
        let lease_ms = int_arg(self.name(), args, 1)?;
        let requested = text_arg(self.name(), args, 2)?;
        if requested != READ && requested != WRITE {
            return Err(StoreError::Script {
                script: self.name().to_string(),
                reason: format!("unknown mode `{requested}`"),
            });
        }

        let Some(mode) = space.hget(key, MODE_FIELD)? else {
            space.hset(key, MODE_FIELD, requested)?;
            space.hset(key, holder, "1")?;
            if lease_ms > 0 {
                space.pexpire(key, lease_ms);
            }
            return Ok(ScriptValue::Int(1));
        };

        let granted = if space.hexists(key, holder)? {
            if mode == WRITE || requested == READ {
                true
            } else if space.hlen(key)? == 2 {
                space.hset(key, MODE_FIELD, WRITE)?;
                true
            } else {
                false
            }
        } else {
            mode == READ && requested == READ
        };
        if granted {
            space.hincr_by(key, holder, 1)?;
            if lease_ms > 0 {
                let ttl = space.pttl(key);
                if ttl >= 0 && ttl < lease_ms {
                    space.pexpire(key, lease_ms);
                }
            }
            return Ok(ScriptValue::Int(1));
        }
        Ok(ScriptValue::Int(0))
    }
}

#[derive(Debug)]
pub(crate) struct ReadWriteProtocol {
    write: bool,
}

impl ReadWriteProtocol {
    pub(crate) const fn read() -> Self {
        Self { write: false }
    }

    pub(crate) const fn write() -> Self {
        Self { write: true }
    }

    const fn mode(&self) -> &'static str {
        if self.write { WRITE } else { READ }
    }
}

#[async_trait]
impl LockProtocol for ReadWriteProtocol {
    fn kind(&self) -> LockKind {
        if self.write { LockKind::Write } else { LockKind::Read }
    }

    async fn acquire(&self, store: &dyn SharedStore, attempt: Attempt<'_>) -> StoreResult<bool> {
        let script = ReadWriteAcquire;
        let reply = store
            .eval(
                &script,
                &[attempt.id.as_str().to_string()],
                &[
                    attempt.holder.as_str().to_string(),
                    attempt.lease_ms.to_string(),
                    self.mode().to_string(),
                ],
            )
            .await?;
        Ok(reply.expect_int(script.name())? == 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn acquire(space: &mut KeySpace, holder: &str, mode: &str) -> bool {
        ReadWriteAcquire
            .apply(
                space,
                &["lock".to_string()],
                &[holder.to_string(), "0".to_string(), mode.to_string()],
            )
            .unwrap()
            == ScriptValue::Int(1)
    }

    #[test]
    fn test_readers_share_writer_excludes() {
        let mut space = KeySpace::new();
        assert!(acquire(&mut space, "r1", READ));
        assert!(acquire(&mut space, "r2", READ));
        assert!(!acquire(&mut space, "w1", WRITE));

        let mut space = KeySpace::new();
        assert!(acquire(&mut space, "w1", WRITE));
        assert!(!acquire(&mut space, "r1", READ));
        assert!(!acquire(&mut space, "w2", WRITE));
        assert!(acquire(&mut space, "w1", WRITE));
        assert!(acquire(&mut space, "w1", READ));
    }

    #[test]
    fn test_reader_upgrades_only_when_alone() {
        let mut space = KeySpace::new();
        assert!(acquire(&mut space, "r1", READ));
        assert!(acquire(&mut space, "r2", READ));
        assert!(!acquire(&mut space, "r1", WRITE));
        assert_eq!(space.hget("lock", MODE_FIELD).unwrap().as_deref(), Some(READ));

        let mut space = KeySpace::new();
        assert!(acquire(&mut space, "r1", READ));
        assert!(acquire(&mut space, "r1", WRITE));
        assert_eq!(space.hget("lock", MODE_FIELD).unwrap().as_deref(), Some(WRITE));
        assert!(!acquire(&mut space, "r2", READ));
    }

    #[test]
    fn test_reader_lease_only_extends() {
        let mut space = KeySpace::new();
        let args = |holder: &str, lease: i64| vec![holder.to_string(), lease.to_string(), READ.to_string()];
        let keys = ["lock".to_string()];

        ReadWriteAcquire.apply(&mut space, &keys, &args("r1", 5_000)).unwrap();
        ReadWriteAcquire.apply(&mut space, &keys, &args("r2", 1_000)).unwrap();
        assert_eq!(space.pttl("lock"), 5_000);
        ReadWriteAcquire.apply(&mut space, &keys, &args("r3", 9_000)).unwrap();
        assert_eq!(space.pttl("lock"), 9_000);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let mut space = KeySpace::new();
        let result = ReadWriteAcquire.apply(
            &mut space,
            &["lock".to_string()],
            &["h".to_string(), "0".to_string(), "upgrade".to_string()],
        );
        assert!(result.is_err());
    }
}
