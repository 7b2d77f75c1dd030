//! Store layout and atomic scripts for one topic.
//!
//! Each partition `p` of topic `t` owns four keys sharing the hash tag
//! `{t:p}`, so a partition's scripts stay on one Redis Cluster slot:
//!
//! | Key | Type | Content |
//! |---|---|---|
//! | `{prefix}:delay:{t:p}:ready` | sorted set | id → not-before ms |
//! | `{prefix}:delay:{t:p}:items` | hash | id → envelope JSON |
//! | `{prefix}:delay:{t:p}:inflight` | sorted set | id → visibility deadline ms |
//! | `{prefix}:delay:{t:p}:attempts` | hash | id → deliveries so far |
//!
//! plus `{prefix}:delay:t:partitions` holding the partition count.
//!
//! An item moves `ready → inflight` when polled and is deleted on ack. An
//! in-flight item whose deadline passes goes back to `ready` on the next
//! poll of its partition.

use crate::error::{DelayError, Result};
use seatlock_core::keyspace::KeySpace;
use seatlock_core::store::{int_arg, key_arg, text_arg, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::{Result as StoreResult, StoreError};
use std::sync::Arc;

/// Expired in-flight items returned to `ready` per poll.
const REQUEUE_BATCH: usize = 100;

const OFFER_LUA: &str = r"
redis.call('hset', KEYS[2], ARGV[1], ARGV[2])
redis.call('zadd', KEYS[1], ARGV[3], ARGV[1])
return 1
";

/// KEYS: ready, items. ARGV: id, envelope, not-before ms.
struct OfferItem;

impl AtomicScript for OfferItem {
    fn name(&self) -> &'static str {
        "seatlock_delay_offer"
    }

    fn source(&self) -> &'static str {
        OFFER_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let ready = key_arg(self.name(), keys, 0)?;
        let items = key_arg(self.name(), keys, 1)?;
        let id = text_arg(self.name(), args, 0)?;
        let envelope = text_arg(self.name(), args, 1)?;
        let not_before = int_arg(self.name(), args, 2)?;

        space.hset(items, id, envelope)?;
        space.zadd(ready, not_before, id)?;
        Ok(ScriptValue::Int(1))
    }
}

const POLL_LUA: &str = r"
local now = tonumber(ARGV[1])
local expired = redis.call('zrangebyscore', KEYS[3], '-inf', now, 'LIMIT', 0, tonumber(ARGV[3]))
for _, id in ipairs(expired) do
  redis.call('zrem', KEYS[3], id)
  redis.call('zadd', KEYS[1], now, id)
end
local head = redis.call('zrange', KEYS[1], 0, 0, 'WITHSCORES')
if #head == 0 then
  return {}
end
local id = head[1]
local due = tonumber(head[2])
if due > now then
  return {due}
end
redis.call('zrem', KEYS[1], id)
local envelope = redis.call('hget', KEYS[2], id)
if not envelope then
  redis.call('hdel', KEYS[4], id)
  return {now}
end
redis.call('zadd', KEYS[3], ARGV[2], id)
local attempt = redis.call('hincrby', KEYS[4], id, 1)
return {id, envelope, attempt, due}
";

/// KEYS: ready, items, inflight, attempts. ARGV: now ms, visibility
/// deadline ms, requeue batch.
///
/// Replies `{}` when the partition is empty, `{next due ms}` when nothing
/// is due yet, or `{id, envelope, attempt, not-before ms}`.
struct PollItem;

impl AtomicScript for PollItem {
    fn name(&self) -> &'static str {
        "seatlock_delay_poll"
    }

    fn source(&self) -> &'static str {
        POLL_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let ready = key_arg(self.name(), keys, 0)?;
        let items = key_arg(self.name(), keys, 1)?;
        let inflight = key_arg(self.name(), keys, 2)?;
        let attempts = key_arg(self.name(), keys, 3)?;
        let now = int_arg(self.name(), args, 0)?;
        let deadline = int_arg(self.name(), args, 1)?;
        let batch = usize::try_from(int_arg(self.name(), args, 2)?).unwrap_or(REQUEUE_BATCH);

        for (id, _) in space.zrange_by_score(inflight, i64::MIN, now, batch)? {
            space.zrem(inflight, &id)?;
            space.zadd(ready, now, &id)?;
        }

        let Some((id, due)) = space.zfirst(ready)? else {
            return Ok(ScriptValue::Array(Vec::new()));
        };
        if due > now {
            return Ok(ScriptValue::Array(vec![ScriptValue::Int(due)]));
        }
        space.zrem(ready, &id)?;
        let Some(envelope) = space.hget(items, &id)? else {
            space.hdel(attempts, &id)?;
            return Ok(ScriptValue::Array(vec![ScriptValue::Int(now)]));
        };
        space.zadd(inflight, deadline, &id)?;
        let attempt = space.hincr_by(attempts, &id, 1)?;
        Ok(ScriptValue::Array(vec![
            ScriptValue::Text(id),
            ScriptValue::Text(envelope),
            ScriptValue::Int(attempt),
            ScriptValue::Int(due),
        ]))
    }
}

const ACK_LUA: &str = r"
redis.call('zrem', KEYS[1], ARGV[1])
local removed = redis.call('zrem', KEYS[3], ARGV[1])
redis.call('hdel', KEYS[2], ARGV[1])
redis.call('hdel', KEYS[4], ARGV[1])
return removed
";

/// KEYS: ready, items, inflight, attempts. ARGV: id. `1` if the item was
/// in flight.
struct AckItem;

impl AtomicScript for AckItem {
    fn name(&self) -> &'static str {
        "seatlock_delay_ack"
    }

    fn source(&self) -> &'static str {
        ACK_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let ready = key_arg(self.name(), keys, 0)?;
        let items = key_arg(self.name(), keys, 1)?;
        let inflight = key_arg(self.name(), keys, 2)?;
        let attempts = key_arg(self.name(), keys, 3)?;
        let id = text_arg(self.name(), args, 0)?;

        space.zrem(ready, id)?;
        let removed = space.zrem(inflight, id)?;
        space.hdel(items, id)?;
        space.hdel(attempts, id)?;
        Ok(ScriptValue::Int(i64::from(removed)))
    }
}

const COUNT_LUA: &str = r"
return {redis.call('zcard', KEYS[1]), redis.call('zcard', KEYS[2])}
";

/// KEYS: ready, inflight. Replies `{ready, inflight}`.
struct CountItems;

impl AtomicScript for CountItems {
    fn name(&self) -> &'static str {
        "seatlock_delay_count"
    }

    fn source(&self) -> &'static str {
        COUNT_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], _args: &[String]) -> StoreResult<ScriptValue> {
        let ready = key_arg(self.name(), keys, 0)?;
        let inflight = key_arg(self.name(), keys, 1)?;
        let ready = i64::try_from(space.zcard(ready)?).unwrap_or(i64::MAX);
        let inflight = i64::try_from(space.zcard(inflight)?).unwrap_or(i64::MAX);
        Ok(ScriptValue::Array(vec![ScriptValue::Int(ready), ScriptValue::Int(inflight)]))
    }
}

const PARTITIONS_LUA: &str = r"
local current = redis.call('get', KEYS[1])
if not current then
  redis.call('set', KEYS[1], ARGV[1])
  return tonumber(ARGV[1])
end
return tonumber(current)
";

/// KEYS: partition count. ARGV: count. Records the count if absent and
/// replies with the recorded one.
struct RecordPartitions;

impl AtomicScript for RecordPartitions {
    fn name(&self) -> &'static str {
        "seatlock_delay_partitions"
    }

    fn source(&self) -> &'static str {
        PARTITIONS_LUA
    }

    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> StoreResult<ScriptValue> {
        let key = key_arg(self.name(), keys, 0)?;
        let count = int_arg(self.name(), args, 0)?;
        match space.get(key)? {
            Some(current) => current.parse().map(ScriptValue::Int).map_err(|_| StoreError::Script {
                script: self.name().to_string(),
                reason: format!("partition count `{current}` is not a number"),
            }),
            None => {
                space.set(key, &count.to_string(), None);
                Ok(ScriptValue::Int(count))
            }
        }
    }
}

/// An item taken from a partition, not yet decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PolledItem {
    pub(crate) id: String,
    pub(crate) envelope: String,
    pub(crate) attempt: u32,
    pub(crate) not_before_ms: i64,
}

/// Outcome of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Poll {
    /// An item is now in flight.
    Item(PolledItem),
    /// Nothing due. Carries the earliest not-before, if any item waits.
    Idle(Option<i64>),
}

/// Handle on one topic's partitions in the shared store.
#[derive(Debug, Clone)]
pub struct TopicQueue {
    store: Arc<dyn SharedStore>,
    prefix: String,
    topic: String,
    partitions: usize,
}

impl TopicQueue {
    /// Create a handle for `topic` split into `partitions`.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::Configuration`] for an empty topic or zero
    /// partitions.
    pub fn new(
        store: Arc<dyn SharedStore>,
        prefix: impl Into<String>,
        topic: impl Into<String>,
        partitions: usize,
    ) -> Result<Self> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(DelayError::configuration("topic name must not be empty"));
        }
        if partitions == 0 {
            return Err(DelayError::configuration(format!("topic `{topic}` needs at least one partition")));
        }
        Ok(Self {
            store,
            prefix: prefix.into(),
            topic,
            partitions,
        })
    }

    /// Topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Partition count.
    #[must_use]
    pub const fn partitions(&self) -> usize {
        self.partitions
    }

    /// Record this handle's partition count in the store, or check it
    /// against the one already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`DelayError::PartitionMismatch`] if the store disagrees, or
    /// a store error.
    pub async fn verify_partitions(&self) -> Result<()> {
        let script = RecordPartitions;
        let key = format!("{}:delay:{}:partitions", self.prefix, self.topic);
        let found = self
            .store
            .eval(&script, &[key], &[self.partitions.to_string()])
            .await?
            .expect_int(script.name())?;

        if usize::try_from(found).ok() == Some(self.partitions) {
            Ok(())
        } else {
            tracing::error!(
                topic = %self.topic,
                expected = self.partitions,
                found,
                "Partition count disagrees with the store"
            );
            Err(DelayError::PartitionMismatch {
                topic: self.topic.clone(),
                expected: self.partitions,
                found: usize::try_from(found).unwrap_or_default(),
            })
        }
    }

    /// Items waiting in `partition`, due or not.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an out-of-range partition, or a
    /// store error.
    pub async fn pending(&self, partition: usize) -> Result<usize> {
        Ok(self.counts(partition).await?.0)
    }

    /// Items of `partition` delivered but not yet acknowledged.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an out-of-range partition, or a
    /// store error.
    pub async fn in_flight(&self, partition: usize) -> Result<usize> {
        Ok(self.counts(partition).await?.1)
    }

    async fn counts(&self, partition: usize) -> Result<(usize, usize)> {
        let [ready, _, inflight, _] = self.keys(partition)?;
        let script = CountItems;
        let reply = self.store.eval(&script, &[ready, inflight], &[]).await?;
        match reply.into_array().as_deref() {
            Some([ready, inflight]) => Ok((
                count(ready.expect_int(script.name())?),
                count(inflight.expect_int(script.name())?),
            )),
            _ => Err(protocol(script.name(), "expected two counts")),
        }
    }

    pub(crate) async fn push(&self, partition: usize, id: &str, envelope: &str, not_before_ms: i64) -> Result<()> {
        let [ready, items, _, _] = self.keys(partition)?;
        self.store
            .eval(
                &OfferItem,
                &[ready, items],
                &[id.to_string(), envelope.to_string(), not_before_ms.to_string()],
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn poll(&self, partition: usize, now_ms: i64, deadline_ms: i64) -> Result<Poll> {
        let script = PollItem;
        let reply = self
            .store
            .eval(
                &script,
                &self.keys(partition)?,
                &[now_ms.to_string(), deadline_ms.to_string(), REQUEUE_BATCH.to_string()],
            )
            .await?;

        let parts = reply
            .into_array()
            .ok_or_else(|| protocol(script.name(), "expected an array"))?;
        match parts.as_slice() {
            [] => Ok(Poll::Idle(None)),
            [due] => Ok(Poll::Idle(Some(due.expect_int(script.name())?))),
            [id, envelope, attempt, due] => Ok(Poll::Item(PolledItem {
                id: text(script.name(), id)?,
                envelope: text(script.name(), envelope)?,
                attempt: u32::try_from(attempt.expect_int(script.name())?).unwrap_or(u32::MAX),
                not_before_ms: due.expect_int(script.name())?,
            })),
            _ => Err(protocol(script.name(), "unexpected reply length")),
        }
    }

    pub(crate) async fn ack(&self, partition: usize, id: &str) -> Result<bool> {
        let script = AckItem;
        let removed = self
            .store
            .eval(&script, &self.keys(partition)?, &[id.to_string()])
            .await?
            .expect_int(script.name())?;
        Ok(removed == 1)
    }

    fn keys(&self, partition: usize) -> Result<[String; 4]> {
        if partition >= self.partitions {
            return Err(DelayError::configuration(format!(
                "partition {partition} out of range for topic `{}` ({} partitions)",
                self.topic, self.partitions
            )));
        }
        let base = format!("{}:delay:{{{}:{partition}}}", self.prefix, self.topic);
        Ok([
            format!("{base}:ready"),
            format!("{base}:items"),
            format!("{base}:inflight"),
            format!("{base}:attempts"),
        ])
    }
}

fn count(value: i64) -> usize {
    usize::try_from(value).unwrap_or_default()
}

fn text(script: &str, value: &ScriptValue) -> Result<String> {
    value
        .as_text()
        .map(ToString::to_string)
        .ok_or_else(|| protocol(script, "expected a string"))
}

fn protocol(script: &str, reason: &str) -> DelayError {
    DelayError::Store(StoreError::Protocol(format!("script `{script}`: {reason}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use seatlock_core::InMemoryStore;

    fn queue(partitions: usize) -> TopicQueue {
        TopicQueue::new(Arc::new(InMemoryStore::new()), "test", "orders", partitions).unwrap()
    }

    #[test]
    fn test_keys_share_hash_tag() {
        let keys = queue(3).keys(2).unwrap();
        assert_eq!(keys[0], "test:delay:{orders:2}:ready");
        assert_eq!(keys[3], "test:delay:{orders:2}:attempts");
        assert!(queue(3).keys(3).is_err());
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let result = TopicQueue::new(Arc::new(InMemoryStore::new()), "test", "orders", 0);
        assert!(matches!(result, Err(DelayError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_poll_respects_not_before() {
        let queue = queue(1);
        queue.push(0, "a", "{}", 1_000).await.unwrap();

        assert_eq!(queue.poll(0, 999, 5_000).await.unwrap(), Poll::Idle(Some(1_000)));
        let Poll::Item(item) = queue.poll(0, 1_000, 5_000).await.unwrap() else {
            unreachable!("item is due");
        };
        assert_eq!((item.id.as_str(), item.attempt, item.not_before_ms), ("a", 1, 1_000));
        assert_eq!(queue.poll(0, 1_001, 5_000).await.unwrap(), Poll::Idle(None));
        assert_eq!(queue.in_flight(0).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unacked_item_returns_after_deadline() {
        let queue = queue(1);
        queue.push(0, "a", "{}", 0).await.unwrap();
        assert!(matches!(queue.poll(0, 10, 100).await.unwrap(), Poll::Item(_)));

        assert_eq!(queue.poll(0, 99, 200).await.unwrap(), Poll::Idle(None));
        let Poll::Item(again) = queue.poll(0, 100, 200).await.unwrap() else {
            unreachable!("deadline passed");
        };
        assert_eq!(again.attempt, 2);

        assert!(queue.ack(0, "a").await.unwrap());
        assert!(!queue.ack(0, "a").await.unwrap());
        assert_eq!((queue.pending(0).await.unwrap(), queue.in_flight(0).await.unwrap()), (0, 0));
    }

    #[tokio::test]
    async fn test_partition_count_recorded_once() {
        let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
        let five = TopicQueue::new(Arc::clone(&store), "test", "orders", 5).unwrap();
        let three = TopicQueue::new(store, "test", "orders", 3).unwrap();

        five.verify_partitions().await.unwrap();
        five.verify_partitions().await.unwrap();
        let err = three.verify_partitions().await.unwrap_err();
        assert!(matches!(err, DelayError::PartitionMismatch { expected: 3, found: 5, .. }));
    }
}
