//! Lock backend on the local filesystem: `<dir>/<code>.lock` created with
//! `O_CREAT|O_EXCL`. Single-host only.

use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    async_trait::async_trait,
    chrono::{DateTime, TimeDelta, Utc},
    fd_lock::RwLock,
    tracing::{debug, info, warn},
};

use crate::{
    Result,
    clock::Clock,
    humanize::humanize_duration,
    lock::{DEFAULT_LOCK_TTL, HeldLocks, LockHolder, LockProvider},
    types::file_stem,
};

pub struct FileLock {
    dir: PathBuf,
    ttl: TimeDelta,
    clock: Arc<dyn Clock>,
    held: HeldLocks,
}

impl FileLock {
    pub fn new(dir: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir,
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

    pub fn lock_path(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(code)))
    }

    fn guard_path(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{}.lock.guard", file_stem(code)))
    }
}

/// Create the lock file if absent. Fails with `AlreadyExists` otherwise.
fn try_create(path: &Path, holder: &LockHolder) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = serde_json::to_vec(holder)?;
    file.write_all(&body)?;
    file.sync_data()
}

/// When the current holder took the lock. Falls back to the file's mtime
/// when the body is unreadable (e.g. a crash mid-write).
fn acquired_at(path: &Path) -> std::io::Result<DateTime<Utc>> {
    match read_holder(path)? {
        Some(holder) => Ok(holder.acquired_at),
        None => Ok(DateTime::<Utc>::from(fs::metadata(path)?.modified()?)),
    }
}

fn read_holder(path: &Path) -> std::io::Result<Option<LockHolder>> {
    let raw = fs::read(path)?;
    match serde_json::from_slice(&raw) {
        Ok(holder) => Ok(Some(holder)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable lock file");
            Ok(None)
        },
    }
}

/// Advisory lock that serializes check-then-modify sequences on a lock file
/// between processes.
fn open_guard(guard_path: &Path) -> std::io::Result<RwLock<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(guard_path)?;
    Ok(RwLock::new(file))
}

fn acquire_blocking(
    lock_path: &Path,
    guard_path: &Path,
    holder: &LockHolder,
    ttl: TimeDelta,
) -> Result<bool> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut guard = open_guard(guard_path)?;
    let _guard = guard.write()?;

    let now = holder.acquired_at;
    match try_create(lock_path, holder) {
        Ok(()) => return Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {},
        Err(e) => return Err(e.into()),
    }

    let since = match acquired_at(lock_path) {
        Ok(since) => since,
        // Released between our create attempt and this read.
        Err(e) if e.kind() == ErrorKind::NotFound => now,
        Err(e) => return Err(e.into()),
    };
    // A deadline past the calendar never expires.
    let fresh = since.checked_add_signed(ttl).is_none_or(|expires| now < expires);
    if fresh && lock_path.exists() {
        return Ok(false);
    }

    info!(path = %lock_path.display(), since = %since, "replacing stale lock file");
    remove_if_exists(lock_path)?;
    try_create(lock_path, holder)?;
    Ok(true)
}

/// Remove the lock file if it still carries `token`. Returns whether it did.
fn release_blocking(lock_path: &Path, guard_path: &Path, token: &str) -> Result<bool> {
    let mut guard = match open_guard(guard_path) {
        Ok(guard) => guard,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let _guard = guard.write()?;

    match read_holder(lock_path) {
        Ok(Some(holder)) if holder.token == token => {
            remove_if_exists(lock_path)?;
            Ok(true)
        },
        Ok(_) => Ok(false),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl LockProvider for FileLock {
    async fn acquire(&self, code: &str) -> Result<bool> {
        let lock_path = self.lock_path(code);
        let guard_path = self.guard_path(code);
        let holder = LockHolder::current(self.clock.now());
        let token = holder.token.clone();
        let ttl = self.ttl;
        let acquired = tokio::task::spawn_blocking(move || {
            acquire_blocking(&lock_path, &guard_path, &holder, ttl)
        })
        .await??;
        if acquired {
            self.held.insert(code, token);
        }
        Ok(acquired)
    }

    async fn release(&self, code: &str) -> Result<()> {
        let Some(token) = self.held.take(code) else {
            debug!(code, "release without a held lock");
            return Ok(());
        };
        let lock_path = self.lock_path(code);
        let guard_path = self.guard_path(code);
        let removed =
            tokio::task::spawn_blocking(move || release_blocking(&lock_path, &guard_path, &token))
                .await??;
        if !removed {
            warn!(code, "lock is no longer held by this run; leaving it in place");
        }
        Ok(())
    }

    async fn force_release(&self, code: &str) -> Result<()> {
        self.held.take(code);
        let lock_path = self.lock_path(code);
        tokio::task::spawn_blocking(move || remove_if_exists(&lock_path)).await??;
        Ok(())
    }

    async fn lock_failed_description(&self, code: &str) -> Result<String> {
        let lock_path = self.lock_path(code);
        let read_path = lock_path.clone();
        let holder = tokio::task::spawn_blocking(move || match read_holder(&read_path) {
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            other => other,
        })
        .await??;

        let holder = match holder {
            Some(holder) => format!(
                "Other run started at {} by {}.",
                holder.acquired_at.format("%Y-%m-%d %H:%M:%S UTC"),
                holder.owner
            ),
            None => "Holder is unknown.".to_string(),
        };
        Ok(format!(
            "{code}: lock has been found. {holder} Current timeout for job: {} (lock file {}).",
            humanize_duration(self.ttl),
            lock_path.display()
        ))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::clock::ManualClock,
        chrono::TimeZone,
        tempfile::TempDir,
    };

    fn setup() -> (TempDir, Arc<ManualClock>, FileLock) {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap(),
        ));
        let lock = FileLock::new(tmp.path().join("locks"), clock.clone())
            .with_ttl(TimeDelta::minutes(10));
        (tmp, clock, lock)
    }

    #[tokio::test]
    async fn second_acquire_is_denied_until_release() {
        let (_tmp, _, lock) = setup();
        assert!(lock.acquire("x").await.unwrap());
        assert!(!lock.acquire("x").await.unwrap());
        lock.release("x").await.unwrap();
        assert!(!lock.lock_path("x").exists());
        assert!(lock.acquire("x").await.unwrap());
    }

    /// Two processes sharing one lock directory.
    fn two_holders() -> (TempDir, Arc<ManualClock>, FileLock, FileLock) {
        let (tmp, clock, first) = setup();
        let second = FileLock::new(tmp.path().join("locks"), clock.clone())
            .with_ttl(TimeDelta::minutes(10));
        (tmp, clock, first, second)
    }

    #[tokio::test]
    async fn late_release_leaves_the_new_holder_alone() {
        let (_tmp, clock, first, second) = two_holders();
        assert!(first.acquire("x").await.unwrap());
        clock.advance(TimeDelta::minutes(11));
        assert!(second.acquire("x").await.unwrap());

        first.release("x").await.unwrap();
        assert!(first.lock_path("x").exists());
        assert!(!first.acquire("x").await.unwrap());

        second.release("x").await.unwrap();
        assert!(!second.lock_path("x").exists());
        assert!(first.acquire("x").await.unwrap());
    }

    #[tokio::test]
    async fn release_only_frees_own_locks() {
        let (_tmp, _, first, second) = two_holders();
        assert!(first.acquire("x").await.unwrap());
        second.release("x").await.unwrap();
        assert!(!second.acquire("x").await.unwrap());
    }

    #[tokio::test]
    async fn force_release_frees_any_holder() {
        let (_tmp, _, first, second) = two_holders();
        assert!(first.acquire("x").await.unwrap());
        second.force_release("x").await.unwrap();
        assert!(!first.lock_path("x").exists());
        assert!(second.acquire("x").await.unwrap());
    }

    #[tokio::test]
    async fn huge_ttl_never_goes_stale() {
        let (_tmp, clock, lock) = setup();
        let lock = lock.with_ttl(TimeDelta::MAX);
        assert!(lock.acquire("x").await.unwrap());
        clock.advance(TimeDelta::days(365 * 100));
        assert!(!lock.acquire("x").await.unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (_tmp, _, lock) = setup();
        lock.release("never-taken").await.unwrap();
        lock.acquire("x").await.unwrap();
        lock.release("x").await.unwrap();
        lock.release("x").await.unwrap();
    }

    #[tokio::test]
    async fn stale_lock_is_replaced_after_ttl() {
        let (_tmp, clock, lock) = setup();
        assert!(lock.acquire("x").await.unwrap());
        clock.advance(TimeDelta::minutes(9));
        assert!(!lock.acquire("x").await.unwrap());
        clock.advance(TimeDelta::minutes(1));
        assert!(lock.acquire("x").await.unwrap());

        let holder = read_holder(&lock.lock_path("x")).unwrap().unwrap();
        assert_eq!(holder.acquired_at, clock.now());
    }

    #[tokio::test]
    async fn concurrent_acquires_have_one_winner() {
        let (_tmp, _, lock) = setup();
        let lock = Arc::new(lock);
        let attempts = (0..8).map(|_| {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move { lock.acquire("x").await.unwrap() })
        });
        let results = futures::future::join_all(attempts).await;
        let winners = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn description_reports_holder() {
        let (_tmp, _, lock) = setup();
        lock.acquire("x").await.unwrap();
        let text = lock.lock_failed_description("x").await.unwrap();
        assert!(text.starts_with("x: lock has been found. Other run started at 2014-01-01"));
        assert!(text.contains("x.lock"));
    }

    #[tokio::test]
    async fn description_after_release_is_still_text() {
        let (_tmp, _, lock) = setup();
        let text = lock.lock_failed_description("x").await.unwrap();
        assert!(text.contains("Holder is unknown."));
    }
}
