//! Lock kinds and the store scripts implementing them.
//!
//! Every kind keeps its lock in a hash named by the identifier: one field
//! per holder, valued with the holder's re-entry count. The kinds differ
//! in who may add a field:
//!
//! - [`LockKind::Reentrant`]: anyone when the hash is empty, otherwise only
//!   a holder already present.
//! - [`LockKind::Fair`]: like reentrant, but a free lock goes to the head of
//!   a waiter queue kept next to the hash. The queue keys come from
//!   [`LockIdentifier::derived`](crate::LockIdentifier::derived), so the
//!   acquire script stays on one Redis Cluster slot.
//! - [`LockKind::Read`] / [`LockKind::Write`]: a `__mode` field records
//!   whether readers or a writer hold the hash; readers share, a writer
//!   excludes everyone else.
//!
//! All kinds release through the same script.

mod fair;
mod read_write;
mod reentrant;

pub(crate) use fair::FairProtocol;
pub(crate) use read_write::ReadWriteProtocol;
pub(crate) use reentrant::ReentrantProtocol;

use crate::error::LockError;
use crate::locker::HolderId;
use crate::naming::LockIdentifier;
use async_trait::async_trait;
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{key_arg, text_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::Result as StoreResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hash field recording read or write mode.
pub(crate) const MODE_FIELD: &str = "__mode";

/// Kind of cluster lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// Mutual exclusion; the same holder may re-acquire.
    #[default]
    Reentrant,
    /// Mutual exclusion granted in arrival order.
    Fair,
    /// Shared with other readers, excluded by a writer.
    Read,
    /// Exclusive against readers and other writers.
    Write,
}

impl LockKind {
    /// Every kind.
    pub const ALL: [Self; 4] = [Self::Reentrant, Self::Fair, Self::Read, Self::Write];

    /// Lower-case name, also used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reentrant => "reentrant",
            Self::Fair => "fair",
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockKind {
    type Err = LockError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| LockError::configuration(format!("unknown lock kind `{name}`")))
    }
}

/// One acquisition attempt.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Attempt<'a> {
    pub id: &'a LockIdentifier,
    pub holder: &'a HolderId,
    /// Lease in milliseconds; `0` keeps the lock until released.
    pub lease_ms: i64,
    pub now_ms: i64,
}

/// Store-side behaviour of one lock kind.
#[async_trait]
pub(crate) trait LockProtocol: Send + Sync + fmt::Debug + 'static {
    fn kind(&self) -> LockKind;

    /// One non-blocking attempt. `true` if the lock is now held by the
    /// attempt's holder.
    async fn acquire(&self, store: &dyn SharedStore, attempt: Attempt<'_>) -> StoreResult<bool>;

    /// Called when a waiter gives up.
    async fn abandon(
        &self,
        _store: &dyn SharedStore,
        _id: &LockIdentifier,
        _holder: &HolderId,
    ) -> StoreResult<()> {
        Ok(())
    }

    /// Every store key the kind uses for `id`.
    fn keys(&self, id: &LockIdentifier) -> Vec<String> {
        vec![id.as_str().to_string()]
    }
}

/// Decrement a holder's count; drop the hash once nobody holds it.
///
/// Returns `-1` if the holder held nothing, otherwise its remaining count.
pub(crate) struct HolderRelease;

const RELEASE_LUA: &str = r"
if redis.call('hexists', KEYS[1], ARGV[1]) == 0 then
  return -1
end
local count = redis.call('hincrby', KEYS[1], ARGV[1], -1)
if count > 0 then
  return count
end
redis.call('hdel', KEYS[1], ARGV[1])
local left = redis.call('hlen', KEYS[1])
if left == 0 or (left == 1 and redis.call('hexists', KEYS[1], '__mode') == 1) then
  redis.call('del', KEYS[1])
end
return 0
";

impl AtomicScript for HolderRelease {
    fn name(&self) -> &'static str {
        "seatlock_lock_release"
    }

    fn source(&self) -> &'static str {
        RELEASE_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let holder = text_arg(self.name(), args, 0)?;

        if !space.hexists(key, holder)? {
            return Ok(ScriptValue::Int(-1));
        }
        let count = space.hincr_by(key, holder, -1)?;
        if count > 0 {
            return Ok(ScriptValue::Int(count));
        }
        space.hdel(key, holder)?;
        let left = space.hlen(key)?;
        if left == 0 || (left == 1 && space.hexists(key, MODE_FIELD)?) {
            space.del(key);
        }
        Ok(ScriptValue::Int(0))
    }
}

/// `1` if the key exists.
pub(crate) struct KeyExists;

impl AtomicScript for KeyExists {
    fn name(&self) -> &'static str {
        "seatlock_key_exists"
    }

    fn source(&self) -> &'static str {
        "return redis.call('exists', KEYS[1])"
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], _args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        Ok(ScriptValue::Int(i64::from(space.exists(key))))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn run(script: &dyn AtomicScript, space: &mut KeySpace, key: &str, args: &[&str]) -> ScriptValue {
        let args: Vec<String> = args.iter().map(ToString::to_string).collect();
        script.apply(space, &[key.to_string()], &args).unwrap()
    }

    #[test]
    fn test_kind_names() {
        assert_eq!("FAIR".parse::<LockKind>().unwrap(), LockKind::Fair);
        assert_eq!(" write ".parse::<LockKind>().unwrap(), LockKind::Write);
        assert_eq!(LockKind::default(), LockKind::Reentrant);
        assert!(matches!("spin".parse::<LockKind>(), Err(LockError::Configuration(_))));
    }

    #[test]
    fn test_release_counts_down_then_deletes() {
        let mut space = KeySpace::new();
        space.hset("lock", "h1", "2").unwrap();

        assert_eq!(run(&HolderRelease, &mut space, "lock", &["h2"]), ScriptValue::Int(-1));
        assert_eq!(run(&HolderRelease, &mut space, "lock", &["h1"]), ScriptValue::Int(1));
        assert_eq!(run(&HolderRelease, &mut space, "lock", &["h1"]), ScriptValue::Int(0));
        assert!(!space.exists("lock"));
        assert_eq!(run(&HolderRelease, &mut space, "lock", &["h1"]), ScriptValue::Int(-1));
    }

    #[test]
    fn test_release_drops_mode_with_last_holder() {
        let mut space = KeySpace::new();
        space.hset("lock", MODE_FIELD, "read").unwrap();
        space.hset("lock", "r1", "1").unwrap();
        space.hset("lock", "r2", "1").unwrap();

        run(&HolderRelease, &mut space, "lock", &["r1"]);
        assert!(space.exists("lock"));
        run(&HolderRelease, &mut space, "lock", &["r2"]);
        assert!(!space.exists("lock"));
        assert_eq!(run(&KeyExists, &mut space, "lock", &[]), ScriptValue::Int(0));
    }
}
