//! JSONL file-backed ledger: one append-only file per job code.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    fd_lock::RwLock,
    tracing::warn,
};

use crate::{
    Result,
    ledger::ExecutionLedger,
    types::{ExecutionRecord, file_stem},
};

/// File-backed ledger. Appends take an exclusive advisory lock on the job's
/// file so concurrent processes never interleave lines.
pub struct FileLedger {
    runs_dir: PathBuf,
}

impl FileLedger {
    pub fn new(runs_dir: PathBuf) -> Self {
        Self { runs_dir }
    }

    fn runs_path(&self, code: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.jsonl", file_stem(code)))
    }

    async fn load(&self, code: &str) -> Result<Vec<ExecutionRecord>> {
        let path = self.runs_path(code);
        tokio::task::spawn_blocking(move || read_records(&path)).await?
    }
}

fn read_records(path: &Path) -> Result<Vec<ExecutionRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let lock = RwLock::new(file);
    let guard = lock.read()?;
    let mut records = Vec::new();
    for line in BufReader::new(&*guard).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str(trimmed) {
            Ok(record) => records.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping malformed ledger line"),
        }
    }
    Ok(records)
}

fn latest(
    records: Vec<ExecutionRecord>,
    pred: impl Fn(&ExecutionRecord) -> bool,
) -> Option<ExecutionRecord> {
    records
        .into_iter()
        .filter(|r| pred(r))
        .max_by_key(|r| r.started_at)
}

#[async_trait]
impl ExecutionLedger for FileLedger {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let path = self.runs_path(&record.code);
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut lock = RwLock::new(file);
            let mut guard = lock.write()?;
            guard.write_all(line.as_bytes())?;
            guard.sync_data()?;
            Ok(())
        })
        .await??;

        Ok(())
    }

    async fn latest_for_job(&self, code: &str) -> Result<Option<ExecutionRecord>> {
        Ok(latest(self.load(code).await?, |_| true))
    }

    async fn latest_successful_for_job(
        &self,
        code: &str,
        exclude_fixed_marker: bool,
    ) -> Result<Option<ExecutionRecord>> {
        Ok(latest(self.load(code).await?, |r| {
            r.success && !(exclude_fixed_marker && r.has_fixed_marker())
        }))
    }

    async fn count_started_since(&self, code: &str, since: DateTime<Utc>) -> Result<u64> {
        let records = self.load(code).await?;
        Ok(records.iter().filter(|r| r.started_at >= since).count() as u64)
    }

    async fn recent_for_job(&self, code: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let mut records = self.load(code).await?;
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        records.truncate(limit);
        Ok(records)
    }
}
