//! In-process key space with Redis-like value types.
//!
//! [`KeySpace`] is the data model behind
//! [`InMemoryStore`](crate::memory::InMemoryStore) and the target of the
//! in-process half of every [`AtomicScript`](crate::store::AtomicScript).
//! Only the commands the seatlock scripts need are provided. Semantics follow
//! Redis where they matter to callers:
//!
//! - expired keys are invisible and removed lazily,
//! - containers that become empty are deleted,
//! - `pttl` returns `-2` for missing keys and `-1` for keys without expiry,
//! - commands against a key of another type fail with `WrongType`.

use crate::error::{Result, StoreError};
use std::collections::{BTreeSet, HashMap, VecDeque};

#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) -> bool {
        let fresh = match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.ordered.remove(&(previous, member.to_string()));
                false
            }
            None => true,
        };
        self.ordered.insert((score, member.to_string()));
        fresh
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    List(VecDeque<String>),
    Sorted(SortedSet),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Self::Text(_) => false,
            Self::Hash(hash) => hash.is_empty(),
            Self::List(list) => list.is_empty(),
            Self::Sorted(set) => set.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at_ms: Option<i64>,
}

/// Redis-flavoured in-memory key space.
///
/// Time is supplied from outside through [`KeySpace::set_now`]; the store
/// refreshes it from its clock before every command or script.
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    entries: HashMap<String, Entry>,
    now_ms: i64,
}

macro_rules! typed {
    ($name:ident, $name_mut:ident, $variant:ident, $ty:ty) => {
        fn $name(&mut self, key: &str) -> Result<Option<&$ty>> {
            match self.live(key) {
                None => Ok(None),
                Some(Entry { value: Value::$variant(inner), .. }) => Ok(Some(inner)),
                Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
            }
        }

        fn $name_mut(&mut self, key: &str) -> Result<&mut $ty> {
            if self.live(key).is_none() {
                self.entries.insert(
                    key.to_string(),
                    Entry { value: Value::$variant(Default::default()), expires_at_ms: None },
                );
            }
            match self.entries.get_mut(key) {
                Some(Entry { value: Value::$variant(inner), .. }) => Ok(inner),
                _ => Err(StoreError::WrongType { key: key.to_string() }),
            }
        }
    };
}

impl KeySpace {
    /// Create an empty key space.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current time in epoch milliseconds.
    pub const fn set_now(&mut self, now_ms: i64) {
        self.now_ms = now_ms;
    }

    /// Current time in epoch milliseconds.
    #[must_use]
    pub const fn now_ms(&self) -> i64 {
        self.now_ms
    }

    fn live(&mut self, key: &str) -> Option<&Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at_ms)
            .is_some_and(|at| at <= self.now_ms);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(|entry| entry.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    typed!(hash, hash_mut, Hash, HashMap<String, String>);
    typed!(list, list_mut, List, VecDeque<String>);
    typed!(sorted, sorted_mut, Sorted, SortedSet);

    // ── keys ────────────────────────────────────────────────────────────

    /// `EXISTS key`
    pub fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// `DEL key`
    pub fn del(&mut self, key: &str) -> bool {
        self.live(key);
        self.entries.remove(key).is_some()
    }

    /// `PEXPIRE key ms`. Non-positive values delete the key.
    pub fn pexpire(&mut self, key: &str, ttl_ms: i64) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        if ttl_ms <= 0 {
            self.entries.remove(key);
            return true;
        }
        let at = self.now_ms.saturating_add(ttl_ms);
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at_ms = Some(at);
        }
        true
    }

    /// `PERSIST key`
    pub fn persist(&mut self, key: &str) -> bool {
        if self.live(key).is_none() {
            return false;
        }
        self.entries
            .get_mut(key)
            .is_some_and(|entry| entry.expires_at_ms.take().is_some())
    }

    /// `PTTL key`: `-2` when missing, `-1` without expiry.
    pub fn pttl(&mut self, key: &str) -> i64 {
        let now = self.now_ms;
        match self.live(key) {
            None => -2,
            Some(Entry { expires_at_ms: None, .. }) => -1,
            Some(Entry { expires_at_ms: Some(at), .. }) => (at - now).max(0),
        }
    }

    /// Number of live keys.
    pub fn len(&mut self) -> usize {
        let now = self.now_ms;
        self.entries
            .retain(|_, entry| entry.expires_at_ms.is_none_or(|at| at > now));
        self.entries.len()
    }

    /// `true` when no live key exists.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    // ── strings ─────────────────────────────────────────────────────────

    /// `GET key`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a string.
    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Text(text), .. }) => Ok(Some(text.clone())),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    /// `SET key value [PX ttl]`. Replaces any existing value and expiry.
    pub fn set(&mut self, key: &str, value: &str, ttl_ms: Option<i64>) {
        let expires_at_ms = ttl_ms.map(|ttl| self.now_ms.saturating_add(ttl));
        self.entries.insert(
            key.to_string(),
            Entry { value: Value::Text(value.to_string()), expires_at_ms },
        );
    }

    /// `INCRBY key delta`. Keeps an existing expiry.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key holds a non-integer value.
    pub fn incr_by(&mut self, key: &str, delta: i64) -> Result<i64> {
        let current = match self.get(key)? {
            Some(text) => text
                .parse::<i64>()
                .map_err(|_| StoreError::WrongType { key: key.to_string() })?,
            None => 0,
        };
        let next = current.saturating_add(delta);
        let expires_at_ms = self.entries.get(key).and_then(|entry| entry.expires_at_ms);
        self.entries.insert(
            key.to_string(),
            Entry { value: Value::Text(next.to_string()), expires_at_ms },
        );
        Ok(next)
    }

    // ── hashes ──────────────────────────────────────────────────────────

    /// `HGET key field`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a hash.
    pub fn hget(&mut self, key: &str, field: &str) -> Result<Option<String>> {
        Ok(self.hash(key)?.and_then(|hash| hash.get(field).cloned()))
    }

    /// `HSET key field value`. Returns `true` if the field is new.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a hash.
    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> Result<bool> {
        Ok(self
            .hash_mut(key)?
            .insert(field.to_string(), value.to_string())
            .is_none())
    }

    /// `HEXISTS key field`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a hash.
    pub fn hexists(&mut self, key: &str, field: &str) -> Result<bool> {
        Ok(self.hash(key)?.is_some_and(|hash| hash.contains_key(field)))
    }

    /// `HDEL key field`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a hash.
    pub fn hdel(&mut self, key: &str, field: &str) -> Result<bool> {
        if self.hash(key)?.is_none() {
            return Ok(false);
        }
        let removed = self.hash_mut(key)?.remove(field).is_some();
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `HLEN key`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a hash.
    pub fn hlen(&mut self, key: &str) -> Result<usize> {
        Ok(self.hash(key)?.map_or(0, HashMap::len))
    }

    /// `HINCRBY key field delta`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a hash or the field is not an
    /// integer.
    pub fn hincr_by(&mut self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let hash = self.hash_mut(key)?;
        let current = match hash.get(field) {
            Some(text) => text
                .parse::<i64>()
                .map_err(|_| StoreError::WrongType { key: key.to_string() })?,
            None => 0,
        };
        let next = current.saturating_add(delta);
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    // ── lists ───────────────────────────────────────────────────────────

    /// `RPUSH key value`. Returns the new length.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a list.
    pub fn rpush(&mut self, key: &str, value: &str) -> Result<usize> {
        let list = self.list_mut(key)?;
        list.push_back(value.to_string());
        Ok(list.len())
    }

    /// `LINDEX key index` (non-negative indexes only).
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a list.
    pub fn lindex(&mut self, key: &str, index: usize) -> Result<Option<String>> {
        Ok(self.list(key)?.and_then(|list| list.get(index).cloned()))
    }

    /// `LPOP key`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a list.
    pub fn lpop(&mut self, key: &str) -> Result<Option<String>> {
        if self.list(key)?.is_none() {
            return Ok(None);
        }
        let popped = self.list_mut(key)?.pop_front();
        self.drop_if_empty(key);
        Ok(popped)
    }

    /// `LREM key 0 value`: remove every occurrence. Returns the count removed.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a list.
    pub fn lrem(&mut self, key: &str, value: &str) -> Result<usize> {
        if self.list(key)?.is_none() {
            return Ok(0);
        }
        let list = self.list_mut(key)?;
        let before = list.len();
        list.retain(|item| item != value);
        let removed = before - list.len();
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `LLEN key`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a list.
    pub fn llen(&mut self, key: &str) -> Result<usize> {
        Ok(self.list(key)?.map_or(0, VecDeque::len))
    }

    // ── sorted sets ─────────────────────────────────────────────────────

    /// `ZADD key score member`. Returns `true` if the member is new.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a sorted set.
    pub fn zadd(&mut self, key: &str, score: i64, member: &str) -> Result<bool> {
        Ok(self.sorted_mut(key)?.insert(member, score))
    }

    /// `ZREM key member`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a sorted set.
    pub fn zrem(&mut self, key: &str, member: &str) -> Result<bool> {
        if self.sorted(key)?.is_none() {
            return Ok(false);
        }
        let removed = self.sorted_mut(key)?.remove(member);
        self.drop_if_empty(key);
        Ok(removed)
    }

    /// `ZSCORE key member`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a sorted set.
    pub fn zscore(&mut self, key: &str, member: &str) -> Result<Option<i64>> {
        Ok(self.sorted(key)?.and_then(|set| set.scores.get(member).copied()))
    }

    /// `ZRANGEBYSCORE key min max WITHSCORES LIMIT 0 limit`, ascending.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a sorted set.
    pub fn zrange_by_score(
        &mut self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<(String, i64)>> {
        Ok(self.sorted(key)?.map_or_else(Vec::new, |set| {
            set.ordered
                .iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .take(limit)
                .map(|(score, member)| (member.clone(), *score))
                .collect()
        }))
    }

    /// Lowest-scored member, if any.
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a sorted set.
    pub fn zfirst(&mut self, key: &str) -> Result<Option<(String, i64)>> {
        Ok(self.sorted(key)?.and_then(|set| {
            set.ordered.iter().next().map(|(score, member)| (member.clone(), *score))
        }))
    }

    /// `ZCARD key`
    ///
    /// # Errors
    ///
    /// Returns `WrongType` if the key is not a sorted set.
    pub fn zcard(&mut self, key: &str) -> Result<usize> {
        Ok(self.sorted(key)?.map_or(0, |set| set.scores.len()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_expired_keys_are_invisible() {
        let mut space = KeySpace::new();
        space.set_now(1_000);
        space.set("k", "v", Some(500));
        assert_eq!(space.pttl("k"), 500);

        space.set_now(1_499);
        assert_eq!(space.get("k").unwrap(), Some("v".to_string()));

        space.set_now(1_500);
        assert_eq!(space.get("k").unwrap(), None);
        assert_eq!(space.pttl("k"), -2);
    }

    #[test]
    fn test_incr_keeps_expiry() {
        let mut space = KeySpace::new();
        assert_eq!(space.incr_by("counter", 1).unwrap(), 1);
        space.pexpire("counter", 100);
        assert_eq!(space.incr_by("counter", 2).unwrap(), 3);
        assert_eq!(space.pttl("counter"), 100);
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let mut space = KeySpace::new();
        space.set("plain", "x", None);
        assert!(matches!(
            space.hincr_by("plain", "f", 1),
            Err(StoreError::WrongType { .. })
        ));
        assert!(space.incr_by("plain", 1).is_err());
    }

    #[test]
    fn test_empty_containers_are_removed() {
        let mut space = KeySpace::new();
        space.hset("h", "a", "1").unwrap();
        space.hdel("h", "a").unwrap();
        assert!(!space.exists("h"));

        space.rpush("l", "x").unwrap();
        space.lpop("l").unwrap();
        assert!(!space.exists("l"));

        space.zadd("z", 5, "m").unwrap();
        space.zrem("z", "m").unwrap();
        assert!(!space.exists("z"));
    }

    #[test]
    fn test_sorted_set_ordering_and_rescore() {
        let mut space = KeySpace::new();
        space.zadd("z", 30, "c").unwrap();
        space.zadd("z", 10, "a").unwrap();
        space.zadd("z", 20, "b").unwrap();
        space.zadd("z", 40, "a").unwrap();

        let ready = space.zrange_by_score("z", 0, 35, 10).unwrap();
        assert_eq!(ready, vec![("b".to_string(), 20), ("c".to_string(), 30)]);
        assert_eq!(space.zfirst("z").unwrap(), Some(("b".to_string(), 20)));
        assert_eq!(space.zcard("z").unwrap(), 3);
    }

    #[test]
    fn test_list_remove_all_occurrences() {
        let mut space = KeySpace::new();
        for item in ["a", "b", "a", "c"] {
            space.rpush("q", item).unwrap();
        }
        assert_eq!(space.lrem("q", "a").unwrap(), 2);
        assert_eq!(space.lindex("q", 0).unwrap(), Some("b".to_string()));
        assert_eq!(space.llen("q").unwrap(), 2);
    }
}
