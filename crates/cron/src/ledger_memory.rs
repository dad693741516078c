//! In-memory ledger for tests and single-process embedding.

use std::sync::Mutex;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
};

use crate::{Result, ledger::ExecutionLedger, types::ExecutionRecord};

/// Ledger backed by a `Vec`. Nothing survives the process.
#[derive(Default)]
pub struct InMemoryLedger {
    records: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record in append order.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn latest_matching(&self, pred: impl Fn(&ExecutionRecord) -> bool) -> Option<ExecutionRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        // max_by_key keeps the last maximum, so ties go to the latest append.
        records
            .iter()
            .filter(|r| pred(r))
            .max_by_key(|r| r.started_at)
            .cloned()
    }
}

#[async_trait]
impl ExecutionLedger for InMemoryLedger {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(record.clone());
        Ok(())
    }

    async fn latest_for_job(&self, code: &str) -> Result<Option<ExecutionRecord>> {
        Ok(self.latest_matching(|r| r.code == code))
    }

    async fn latest_successful_for_job(
        &self,
        code: &str,
        exclude_fixed_marker: bool,
    ) -> Result<Option<ExecutionRecord>> {
        Ok(self.latest_matching(|r| {
            r.code == code && r.success && !(exclude_fixed_marker && r.has_fixed_marker())
        }))
    }

    async fn count_started_since(&self, code: &str, since: DateTime<Utc>) -> Result<u64> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        Ok(records
            .iter()
            .filter(|r| r.code == code && r.started_at >= since)
            .count() as u64)
    }

    async fn recent_for_job(&self, code: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<ExecutionRecord> =
            records.iter().filter(|r| r.code == code).cloned().collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        matching.truncate(limit);
        Ok(matching)
    }
}
