//! Shared key-value store facade.
//!
//! Everything that must be agreed on across processes (cluster locks,
//! admission counters, delayed items) lives in a store reached through the
//! [`SharedStore`] trait. The core never depends on a specific product.
//!
//! # Atomic scripts
//!
//! Multi-key read-modify-write operations are expressed as [`AtomicScript`]s.
//! A script carries:
//!
//! - a stable name (used for caching and logging),
//! - its Lua source, executed by Redis-compatible stores,
//! - an equivalent in-process implementation over a [`KeySpace`], executed
//!   by [`InMemoryStore`](crate::memory::InMemoryStore) while holding its lock.
//!
//! Both implementations must produce the same [`ScriptValue`] for the same
//! keys, arguments and store contents.

use crate::error::{Result, StoreError};
use crate::keyspace::KeySpace;
use async_trait::async_trait;
use std::time::Duration;

/// Reply of an atomic script.
///
/// Mirrors what a Lua script can return through Redis: integers, strings,
/// nested arrays and `nil` (Lua `false`/`nil`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    /// No value
    Nil,
    /// Integer reply
    Int(i64),
    /// String reply
    Text(String),
    /// Array reply
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    /// Integer view of the reply. Numeric strings are accepted.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(text) => text.parse().ok(),
            Self::Nil | Self::Array(_) => None,
        }
    }

    /// String view of the reply.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Consume the reply as an array. `Nil` becomes an empty array.
    #[must_use]
    pub fn into_array(self) -> Option<Vec<Self>> {
        match self {
            Self::Array(items) => Some(items),
            Self::Nil => Some(Vec::new()),
            _ => None,
        }
    }

    /// `true` for [`ScriptValue::Nil`].
    #[must_use]
    pub const fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }

    /// Integer view, or a protocol error naming the script.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Protocol`] if the reply is not an integer.
    pub fn expect_int(&self, script: &str) -> Result<i64> {
        self.as_int().ok_or_else(|| {
            StoreError::Protocol(format!("script `{script}` returned {self:?}, expected integer"))
        })
    }
}

impl From<i64> for ScriptValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<String> for ScriptValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Option<String>> for ScriptValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(Self::Nil, Self::Text)
    }
}

/// An atomic read-modify-write operation over several keys.
///
/// Implementations are stateless descriptions; stores decide how to run
/// them atomically.
pub trait AtomicScript: Send + Sync {
    /// Stable script name.
    fn name(&self) -> &'static str;

    /// Lua source for Redis-compatible stores (`KEYS` / `ARGV` convention).
    fn source(&self) -> &'static str;

    /// In-process twin of [`AtomicScript::source`].
    ///
    /// # Errors
    ///
    /// Returns an error on malformed arguments or wrongly-typed keys.
    fn apply(&self, space: &mut KeySpace, keys: &[String], args: &[String]) -> Result<ScriptValue>;
}

/// Client facade over the shared key-value store.
///
/// All operations are single round-trips. Anything that must read and then
/// write goes through [`SharedStore::eval`], never through a `get` followed
/// by a `set` from application code.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Read a string value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or the key holds
    /// a non-string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value, optionally expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Add `delta` to an integer value (missing keys count as zero).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or the value is
    /// not an integer.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;

    /// Set a time-to-live on an existing key. Returns `false` if the key
    /// does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Run an atomic script.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store is unreachable or the script fails.
    async fn eval(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue>;
}

/// Parse the `index`-th script argument as an integer.
///
/// # Errors
///
/// Returns [`StoreError::Script`] if the argument is missing or not numeric.
pub fn int_arg(script: &str, args: &[String], index: usize) -> Result<i64> {
    args.get(index)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| StoreError::Script {
            script: script.to_string(),
            reason: format!("ARGV[{}] missing or not an integer", index + 1),
        })
}

/// Borrow the `index`-th script argument.
///
/// # Errors
///
/// Returns [`StoreError::Script`] if the argument is missing.
pub fn text_arg<'a>(script: &str, args: &'a [String], index: usize) -> Result<&'a str> {
    args.get(index).map(String::as_str).ok_or_else(|| StoreError::Script {
        script: script.to_string(),
        reason: format!("ARGV[{}] missing", index + 1),
    })
}

/// Borrow the `index`-th script key.
///
/// # Errors
///
/// Returns [`StoreError::Script`] if the key is missing.
pub fn key_arg<'a>(script: &str, keys: &'a [String], index: usize) -> Result<&'a str> {
    keys.get(index).map(String::as_str).ok_or_else(|| StoreError::Script {
        script: script.to_string(),
        reason: format!("KEYS[{}] missing", index + 1),
    })
}

/// Milliseconds in a duration, saturating at `i64::MAX`.
#[must_use]
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_value_int_views() {
        assert_eq!(ScriptValue::Int(7).as_int(), Some(7));
        assert_eq!(ScriptValue::Text("42".into()).as_int(), Some(42));
        assert_eq!(ScriptValue::Nil.as_int(), None);
        assert!(ScriptValue::Array(vec![]).expect_int("probe").is_err());
    }

    #[test]
    fn test_nil_is_empty_array() {
        assert_eq!(ScriptValue::Nil.into_array(), Some(vec![]));
        assert_eq!(ScriptValue::Int(1).into_array(), None);
    }

    #[test]
    fn test_argument_helpers() {
        let args = vec!["15".to_string(), "holder".to_string()];
        assert_eq!(int_arg("probe", &args, 0), Ok(15));
        assert!(int_arg("probe", &args, 1).is_err());
        assert_eq!(text_arg("probe", &args, 1), Ok("holder"));
        assert!(text_arg("probe", &args, 2).is_err());
    }
}
