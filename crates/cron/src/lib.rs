//! Stateless job scheduling driven by an external periodic trigger.
//! Run history in the execution ledger is the only scheduling state; a
//! per-job lock keeps concurrent invocations from running the same job twice.

pub mod cache;
pub mod clock;
pub mod coordinator;
pub mod error;
pub mod humanize;
pub mod job;
pub mod ledger;
pub mod ledger_file;
pub mod ledger_memory;
pub mod ledger_sqlite;
pub mod lock;
pub mod lock_cache;
pub mod lock_file;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod types;

pub use {
    coordinator::{Coordinator, JobReport},
    error::{Error, Result},
    job::{ConfiguredJob, Job, JobWork},
    ledger::{ExecutionLedger, open_ledger},
    lock::{LockProvider, open_lock_provider},
    registry::{JobRegistry, RegistrationError, RegistrationErrorKind},
    runner::{JobRunner, RunOptions, RunOutcome},
    schedule::{Decision, Schedule},
    types::ExecutionRecord,
};

/// Run database migrations for the SQLite ledger.
///
/// Creates the `execution_log` table. [`ledger_sqlite::SqliteLedger::new`]
/// calls this itself; call it directly when sharing a pool.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
