//! Shared key/value caches with add-if-absent semantics, used by the cache
//! lock backend.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    cadence_config::{CacheBackend, CacheConfig},
    chrono::{DateTime, TimeDelta, Utc},
    redis::aio::ConnectionManager,
    tokio::sync::OnceCell,
    tracing::debug,
};

use crate::{Error, Result, clock::Clock};

#[async_trait]
pub trait Cache: Send + Sync {
    /// Store `value` under `key` only if the key is absent or expired.
    /// Returns whether the value was stored.
    async fn add(&self, key: &str, value: &str, ttl: TimeDelta) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete `key` only while it still holds `value`, atomically.
    /// Returns whether the key was deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool>;

    /// The key as stored in the backend, for diagnostics.
    fn storage_key(&self, key: &str) -> String {
        key.to_string()
    }
}

/// Build the cache named by `config`.
pub fn open_cache(config: &CacheConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn Cache>> {
    let cache: Arc<dyn Cache> = match config.backend {
        CacheBackend::Redis => Arc::new(RedisCache::new(&config.url, &config.key_prefix)?),
        CacheBackend::Memory => Arc::new(MemoryCache::new(clock)),
    };
    Ok(cache)
}

// ── Memory ──────────────────────────────────────────────────────────────────

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
}

/// Process-local cache. Entries expire passively against the injected clock.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn add(&self, key: &str, value: &str, ttl: TimeDelta) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get(key)
            && now < entry.expires_at
        {
            return Ok(false);
        }
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| Error::message(format!("cache ttl out of range: {ttl}")))?;
        entries.insert(key.to_string(), Entry {
            value: value.to_string(),
            expires_at,
        });
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let matches = entries
            .get(key)
            .is_some_and(|entry| now < entry.expires_at && entry.value == value);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

// ── Redis ───────────────────────────────────────────────────────────────────

/// Redis cache. `add` is a single `SET NX PX`, so concurrent processes
/// racing for the same key see exactly one winner.
pub struct RedisCache {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    key_prefix: String,
    compare_and_delete: redis::Script,
}

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

impl RedisCache {
    /// Validates the URL only; the connection opens on first use.
    pub fn new(url: &str, key_prefix: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: OnceCell::new(),
            key_prefix: key_prefix.to_string(),
            compare_and_delete: redis::Script::new(COMPARE_AND_DELETE),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager> {
        let conn = self
            .conn
            .get_or_try_init(|| self.client.get_connection_manager())
            .await?;
        Ok(conn.clone())
    }

    fn build_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn add(&self, key: &str, value: &str, ttl: TimeDelta) -> Result<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.num_milliseconds().max(1);
        let stored: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        debug!(key = %full_key, stored = stored.is_some(), "cache add");
        Ok(stored.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let full_key = self.build_key(key);
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(&full_key)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let full_key = self.build_key(key);
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL")
            .arg(&full_key)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool> {
        let full_key = self.build_key(key);
        let mut conn = self.connection().await?;
        let removed: i64 = self
            .compare_and_delete
            .key(&full_key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        debug!(key = %full_key, removed, "cache compare-and-delete");
        Ok(removed > 0)
    }

    fn storage_key(&self, key: &str) -> String {
        self.build_key(key)
    }
}
