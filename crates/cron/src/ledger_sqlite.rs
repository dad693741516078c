//! SQLite-backed execution ledger using sqlx.

use std::path::Path;

use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions, sqlite::SqliteRow},
};

use crate::{Error, Result, ledger::ExecutionLedger, types::ExecutionRecord};

const SELECT_COLUMNS: &str =
    "SELECT code, started_at_ms, finished_at_ms, success, message, schedule_extra FROM execution_log";

/// SQLite persistence for run history. Each append is one `INSERT`.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Create a ledger with its own connection pool and run migrations.
    ///
    /// Use this for a standalone ledger database. For a shared pool, use
    /// [`SqliteLedger::with_pool`] after calling [`crate::run_migrations`].
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to `:memory:` opens a fresh database, so keep one.
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        if let Some(parent) = database_path(database_url).and_then(Path::parent)
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| Error::external("failed to connect to SQLite", e))?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a ledger using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Delete every record, keeping the schema. Returns the number removed.
    pub async fn clear(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM execution_log")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_latest(&self, sql: String, code: &str) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(&sql)
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl ExecutionLedger for SqliteLedger {
    async fn append(&self, record: &ExecutionRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution_log (code, started_at_ms, finished_at_ms, success, message, schedule_extra)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.code)
        .bind(record.started_at.timestamp_millis())
        .bind(record.finished_at.map(|t| t.timestamp_millis()))
        .bind(record.success)
        .bind(&record.message)
        .bind(record.schedule_extra.as_deref().unwrap_or(""))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_for_job(&self, code: &str) -> Result<Option<ExecutionRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE code = ? ORDER BY started_at_ms DESC, id DESC LIMIT 1");
        self.fetch_latest(sql, code).await
    }

    async fn latest_successful_for_job(
        &self,
        code: &str,
        exclude_fixed_marker: bool,
    ) -> Result<Option<ExecutionRecord>> {
        let marker_clause = if exclude_fixed_marker {
            " AND schedule_extra = ''"
        } else {
            ""
        };
        let sql = format!(
            "{SELECT_COLUMNS} WHERE code = ? AND success = 1{marker_clause}
             ORDER BY started_at_ms DESC, id DESC LIMIT 1"
        );
        self.fetch_latest(sql, code).await
    }

    async fn count_started_since(&self, code: &str, since: DateTime<Utc>) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM execution_log WHERE code = ? AND started_at_ms >= ?",
        )
        .bind(code)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn recent_for_job(&self, code: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let sql = format!("{SELECT_COLUMNS} WHERE code = ? ORDER BY started_at_ms DESC, id DESC LIMIT ?");
        let rows = sqlx::query(&sql)
            .bind(code)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }
}

/// Filesystem path of a `sqlite:` URL, if it names a file.
fn database_path(url: &str) -> Option<&Path> {
    let rest = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))?;
    let path = rest.split('?').next()?;
    (!path.is_empty() && !path.contains(":memory:")).then(|| Path::new(path))
}

fn record_from_row(row: &SqliteRow) -> Result<ExecutionRecord> {
    let started_at_ms: i64 = row.try_get("started_at_ms")?;
    let finished_at_ms: Option<i64> = row.try_get("finished_at_ms")?;
    let extra: String = row.try_get("schedule_extra")?;
    Ok(ExecutionRecord {
        code: row.try_get("code")?,
        started_at: from_millis(started_at_ms)?,
        finished_at: finished_at_ms.map(from_millis).transpose()?,
        success: row.try_get("success")?,
        message: row.try_get("message")?,
        schedule_extra: (!extra.is_empty()).then_some(extra),
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::message(format!("timestamp out of range: {ms}")))
}
