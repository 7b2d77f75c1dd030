//! # Seatlock Redis
//!
//! [`SharedStore`] implementation over Redis.
//!
//! Commands go through a [`ConnectionManager`], which reconnects on its own
//! after a dropped connection. Atomic scripts run server-side with
//! `EVALSHA`, falling back to `EVAL` (and caching the script) the first time
//! a server sees a given script.
//!
//! # Example
//!
//! ```no_run
//! use seatlock_redis::RedisStore;
//! use seatlock_core::store::SharedStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
//! store.set("greeting", "hello", None).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError, Script, Value};
use seatlock_core::store::{duration_ms, AtomicScript, ScriptValue, SharedStore};
use seatlock_core::{Result, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Redis-backed shared store.
///
/// Cheap to clone; clones share the connection and the script cache.
#[derive(Clone)]
pub struct RedisStore {
    conn_manager: ConnectionManager,
    scripts: Arc<Mutex<HashMap<&'static str, Arc<Script>>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - `Redis` connection URL (e.g., "<redis://127.0.0.1:6379>")
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the URL is invalid or the
    /// server cannot be reached.
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis client: {e}"))
        })?;

        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis connection manager: {e}"))
        })?;

        tracing::info!(url = %redact(redis_url), "Connected to Redis");
        Ok(Self::from_manager(conn_manager))
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn script(&self, script: &dyn AtomicScript) -> Arc<Script> {
        let mut cache = self.scripts.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            cache
                .entry(script.name())
                .or_insert_with(|| Arc::new(Script::new(script.source()))),
        )
    }
}

/// Strip credentials from a URL before logging it.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

fn command_error(command: &str, key: &str, error: &RedisError) -> StoreError {
    if error.code() == Some("WRONGTYPE") {
        return StoreError::WrongType { key: key.to_string() };
    }
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
    {
        tracing::warn!(command, key, error = %error, "Redis unavailable");
        return StoreError::Unavailable(format!("{command} {key}: {error}"));
    }
    StoreError::Protocol(format!("{command} {key}: {error}"))
}

fn script_error(name: &str, error: &RedisError) -> StoreError {
    if error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
    {
        tracing::warn!(script = name, error = %error, "Redis unavailable during script");
        return StoreError::Unavailable(format!("script {name}: {error}"));
    }
    StoreError::Script {
        script: name.to_string(),
        reason: error.to_string(),
    }
}

/// Convert a raw Redis reply into a [`ScriptValue`].
///
/// # Errors
///
/// Returns [`StoreError::Protocol`] for reply types scripts never produce
/// (maps, doubles, ...).
pub fn script_value(value: Value) -> Result<ScriptValue> {
    match value {
        Value::Nil => Ok(ScriptValue::Nil),
        Value::Int(number) => Ok(ScriptValue::Int(number)),
        Value::Okay => Ok(ScriptValue::Text("OK".to_string())),
        Value::SimpleString(text) => Ok(ScriptValue::Text(text)),
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(ScriptValue::Text)
            .map_err(|e| StoreError::Protocol(format!("non UTF-8 script reply: {e}"))),
        Value::Array(items) => items
            .into_iter()
            .map(script_value)
            .collect::<Result<Vec<_>>>()
            .map(ScriptValue::Array),
        other => Err(StoreError::Protocol(format!("unsupported script reply: {other:?}"))),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn_manager.clone();
        conn.get(key).await.map_err(|e| command_error("GET", key, &e))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn_manager.clone();
        match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(key, value, millis)
                    .await
                    .map_err(|e| command_error("PSETEX", key, &e))
            }
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| command_error("SET", key, &e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn.del(key).await.map_err(|e| command_error("DEL", key, &e))?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn_manager.clone();
        conn.incr(key, delta)
            .await
            .map_err(|e| command_error("INCRBY", key, &e))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn_manager.clone();
        conn.pexpire(key, duration_ms(ttl))
            .await
            .map_err(|e| command_error("PEXPIRE", key, &e))
    }

    async fn eval(
        &self,
        script: &dyn AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> Result<ScriptValue> {
        let mut conn = self.conn_manager.clone();
        let compiled = self.script(script);
        let mut invocation = compiled.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let reply: Value = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| script_error(script.name(), &e))?;
        script_value(reply)
    }
}
