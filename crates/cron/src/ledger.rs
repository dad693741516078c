//! Execution ledger: the append-only run history that drives scheduling.

use std::sync::Arc;

use {
    async_trait::async_trait,
    cadence_config::{LedgerBackend, LedgerConfig},
    chrono::{DateTime, Utc},
};

use crate::{
    Result, ledger_file::FileLedger, ledger_memory::InMemoryLedger, ledger_sqlite::SqliteLedger,
    types::ExecutionRecord,
};

/// Durable store of completed run attempts.
///
/// Every query is a point-in-time read. Implementations must make `append`
/// a single atomic write so concurrent processes need no extra coordination.
#[async_trait]
pub trait ExecutionLedger: Send + Sync {
    async fn append(&self, record: &ExecutionRecord) -> Result<()>;

    /// Latest record for `code` by start time, whatever its outcome.
    async fn latest_for_job(&self, code: &str) -> Result<Option<ExecutionRecord>>;

    /// Latest successful record for `code` by start time. With
    /// `exclude_fixed_marker`, records tagged by a fixed-time schedule are
    /// ignored.
    async fn latest_successful_for_job(
        &self,
        code: &str,
        exclude_fixed_marker: bool,
    ) -> Result<Option<ExecutionRecord>>;

    /// Number of records for `code` that started at or after `since`.
    async fn count_started_since(&self, code: &str, since: DateTime<Utc>) -> Result<u64>;

    /// Up to `limit` records for `code`, newest first.
    async fn recent_for_job(&self, code: &str, limit: usize) -> Result<Vec<ExecutionRecord>>;
}

/// Open the ledger selected by `config`, running migrations where needed.
pub async fn open_ledger(config: &LedgerConfig) -> Result<Arc<dyn ExecutionLedger>> {
    let ledger: Arc<dyn ExecutionLedger> = match config.backend {
        LedgerBackend::Sqlite => Arc::new(SqliteLedger::new(&config.database_url).await?),
        LedgerBackend::File => Arc::new(FileLedger::new(config.runs_dir.clone())),
        LedgerBackend::Memory => Arc::new(InMemoryLedger::new()),
    };
    Ok(ledger)
}
