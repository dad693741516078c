//! Per-job mutual exclusion across processes and hosts.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use {
    async_trait::async_trait,
    cadence_config::{CacheConfig, LockBackend, LockConfig},
    chrono::{DateTime, TimeDelta, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{
    Error, Result, cache::open_cache, clock::Clock, lock_cache::CacheLock, lock_file::FileLock,
};

/// Default lock lifetime. A crashed holder wedges its job for at most this long.
pub const DEFAULT_LOCK_TTL: TimeDelta = TimeDelta::hours(24);

#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Try to take the lock for `code`. `false` means someone else holds it.
    async fn acquire(&self, code: &str) -> Result<bool>;

    /// Release a lock this provider acquired for `code`. A lock that was
    /// taken over after its TTL belongs to the new holder and is left alone.
    /// Releasing an unheld lock is a no-op.
    async fn release(&self, code: &str) -> Result<()>;

    /// Remove the lock for `code` whoever holds it.
    async fn force_release(&self, code: &str) -> Result<()>;

    /// Who appears to hold the lock for `code`, for log lines only.
    async fn lock_failed_description(&self, code: &str) -> Result<String>;
}

/// What a lock medium stores about its current holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockHolder {
    /// `hostname:pid` of the acquiring process.
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    /// Unique per acquisition; release compares it before deleting.
    #[serde(default)]
    pub token: String,
}

impl LockHolder {
    pub fn current(acquired_at: DateTime<Utc>) -> Self {
        Self {
            owner: process_owner(),
            acquired_at,
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

/// Tokens of the locks a provider currently holds, keyed by job code.
#[derive(Default)]
pub(crate) struct HeldLocks(Mutex<HashMap<String, String>>);

impl HeldLocks {
    pub(crate) fn insert(&self, code: &str, token: String) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(code.to_string(), token);
    }

    pub(crate) fn take(&self, code: &str) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(code)
    }
}

fn process_owner() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

/// Build the lock backend selected by `config`.
pub fn open_lock_provider(
    config: &LockConfig,
    caches: &BTreeMap<String, CacheConfig>,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn LockProvider>> {
    let ttl = i64::try_from(config.ttl_secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .filter(|ttl| clock.now().checked_add_signed(*ttl).is_some())
        .ok_or_else(|| Error::message(format!("lock ttl out of range: {}s", config.ttl_secs)))?;

    let provider: Arc<dyn LockProvider> = match config.backend {
        LockBackend::File => Arc::new(FileLock::new(config.lockfile_dir.clone(), clock).with_ttl(ttl)),
        LockBackend::Cache => {
            let cache_config = caches
                .get(&config.cache)
                .ok_or_else(|| Error::unknown_cache(config.cache.as_str()))?;
            let cache = open_cache(cache_config, Arc::clone(&clock))?;
            Arc::new(CacheLock::new(cache, clock).with_ttl(ttl))
        },
    };
    Ok(provider)
}
