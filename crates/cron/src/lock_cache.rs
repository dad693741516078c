//! Lock backend over a shared [`Cache`]: one key per job code, taken with
//! add-if-absent and left to expire on its TTL if never released.

use std::sync::Arc;

use {
    async_trait::async_trait,
    chrono::TimeDelta,
    tracing::{debug, warn},
};

use crate::{
    Result,
    cache::Cache,
    clock::Clock,
    humanize::humanize_duration,
    lock::{DEFAULT_LOCK_TTL, HeldLocks, LockHolder, LockProvider},
};

pub struct CacheLock {
    cache: Arc<dyn Cache>,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
    /// Exact values this lock stored, so release only deletes its own.
    held: HeldLocks,
}

impl CacheLock {
    pub fn new(cache: Arc<dyn Cache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache,
            ttl: DEFAULT_LOCK_TTL,
            clock,
            held: HeldLocks::default(),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: TimeDelta) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl LockProvider for CacheLock {
    async fn acquire(&self, code: &str) -> Result<bool> {
        let holder = LockHolder::current(self.clock.now());
        let value = serde_json::to_string(&holder)?;
        let added = self.cache.add(code, &value, self.ttl).await?;
        if added {
            self.held.insert(code, value);
        }
        Ok(added)
    }

    async fn release(&self, code: &str) -> Result<()> {
        let Some(value) = self.held.take(code) else {
            debug!(code, "release without a held lock");
            return Ok(());
        };
        if !self.cache.delete_if_equals(code, &value).await? {
            warn!(code, "lock is no longer held by this run; leaving it in place");
        }
        Ok(())
    }

    async fn force_release(&self, code: &str) -> Result<()> {
        self.held.take(code);
        self.cache.delete(code).await
    }

    async fn lock_failed_description(&self, code: &str) -> Result<String> {
        let holder = match self.cache.get(code).await? {
            Some(raw) => match serde_json::from_str::<LockHolder>(&raw) {
                Ok(holder) => format!(
                    "Other run started at {} by {}.",
                    holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    holder.owner
                ),
                Err(e) => {
                    warn!(code, error = %e, "unreadable lock holder in cache");
                    "Holder is unreadable.".to_string()
                },
            },
            None => "Holder has already released it.".to_string(),
        };
        Ok(format!(
            "{code}: lock has been found. {holder} Current timeout for job: {} (cache key `{}`).",
            humanize_duration(self.ttl),
            self.cache.storage_key(code)
        ))
    }
}
