use std::sync::Arc;

use {
    anyhow::bail,
    cadence_config::CadenceConfig,
    cadence_cron::{
        Coordinator, ExecutionRecord, JobRegistry, JobRunner, RegistrationError, RunOptions,
        clock::{Clock, SystemClock},
        humanize::humanize_duration,
        open_ledger, open_lock_provider,
    },
    tracing::error,
};

const MESSAGE_HEAD_CHARS: usize = 60;

pub async fn handle_run(
    config: &CadenceConfig,
    codes: &[String],
    force: bool,
    silent: bool,
) -> anyhow::Result<()> {
    let jobs = match JobRegistry::with_builtin().build(&config.jobs) {
        Ok(jobs) => jobs,
        Err(errors) => {
            report_registration_errors(&errors);
            bail!("{} job registration error(s); nothing was run", errors.len());
        },
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ledger = open_ledger(&config.ledger).await?;
    let locks = open_lock_provider(&config.lock, &config.caches, Arc::clone(&clock))?;
    let runner = JobRunner::new(ledger, locks)
        .with_clock(clock)
        .with_message_max_length(config.ledger.message_max_length);

    // Job failures are recorded in the ledger and do not fail the process.
    Coordinator::new(runner, jobs)
        .run(codes, RunOptions { force, silent })
        .await?;
    Ok(())
}

pub fn handle_check(config: &CadenceConfig) -> anyhow::Result<()> {
    let errors = JobRegistry::with_builtin().validate(&config.jobs);
    if errors.is_empty() {
        println!("{} job(s) OK.", config.jobs.len());
        return Ok(());
    }
    report_registration_errors(&errors);
    bail!("{} job registration error(s)", errors.len())
}

pub async fn handle_history(config: &CadenceConfig, code: &str, limit: usize) -> anyhow::Result<()> {
    let ledger = open_ledger(&config.ledger).await?;
    let records = ledger.recent_for_job(code, limit).await?;
    if records.is_empty() {
        println!("No runs recorded for {code}.");
        return Ok(());
    }
    for record in &records {
        println!("{}", history_line(record));
    }
    Ok(())
}

pub async fn handle_unlock(config: &CadenceConfig, code: &str) -> anyhow::Result<()> {
    let locks = open_lock_provider(&config.lock, &config.caches, Arc::new(SystemClock))?;
    locks.force_release(code).await?;
    println!("Released lock for {code}.");
    Ok(())
}

fn report_registration_errors(errors: &[RegistrationError]) {
    for e in errors {
        error!(id = e.kind.id(), object = %e.object, "{e}");
        eprintln!("{e}");
    }
}

fn history_line(record: &ExecutionRecord) -> String {
    let status = match (record.finished_at, record.success) {
        (None, _) => "running",
        (Some(_), true) => "ok",
        (Some(_), false) => "FAILED",
    };
    let duration = record
        .duration()
        .map(humanize_duration)
        .unwrap_or_else(|| "-".to_string());
    let slot = record
        .schedule_extra
        .as_deref()
        .map(|s| format!(" [{s}]"))
        .unwrap_or_default();
    format!(
        "{}  {status:<7} {duration:<24} {}{slot}",
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        message_head(&record.message)
    )
}

/// First line of `message`, cut to a fixed width.
fn message_head(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= MESSAGE_HEAD_CHARS {
        return line.to_string();
    }
    let head: String = line.chars().take(MESSAGE_HEAD_CHARS - 1).collect();
    format!("{head}…")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        chrono::{TimeDelta, TimeZone, Utc},
    };

    #[test]
    fn message_head_takes_first_line_and_cuts() {
        assert_eq!(message_head("short\nsecond line"), "short");
        assert_eq!(message_head(""), "");
        let long = "x".repeat(100);
        let head = message_head(&long);
        assert_eq!(head.chars().count(), MESSAGE_HEAD_CHARS);
        assert!(head.ends_with('…'));
    }

    #[test]
    fn history_line_shows_status_duration_and_slot() {
        let started = Utc.with_ymd_and_hms(2014, 1, 1, 6, 0, 0).unwrap();
        let record = ExecutionRecord {
            finished_at: Some(started + TimeDelta::seconds(61)),
            success: false,
            message: "boom\ntrace".into(),
            schedule_extra: Some("06:00".into()),
            ..ExecutionRecord::started("x", started)
        };
        let line = history_line(&record);
        assert!(line.starts_with("2014-01-01 06:00:00  FAILED"), "{line}");
        assert!(line.contains("1 minute, 1 second"), "{line}");
        assert!(line.ends_with("boom [06:00]"), "{line}");
    }

    #[test]
    fn check_reports_bad_entries() {
        let config = CadenceConfig {
            jobs: vec![serde_json::json!({ "code": "x" })],
            ..Default::default()
        };
        assert!(handle_check(&config).is_err());
    }

    #[tokio::test]
    async fn run_with_unknown_code_fails_without_running() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut config = CadenceConfig::default();
        config.ledger.backend = cadence_config::LedgerBackend::File;
        config.ledger.runs_dir = tmp.path().join("runs");
        config.lock.lockfile_dir = tmp.path().join("locks");
        config.jobs = vec![serde_json::json!({
            "code": "echo",
            "command": "echo hi",
            "schedule": { "run_every_mins": 5 }
        })];

        let err = handle_run(&config, &["nope".to_string()], false, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(!tmp.path().join("runs").exists());

        handle_run(&config, &[], false, false).await.unwrap();
        let ledger = open_ledger(&config.ledger).await.unwrap();
        let runs = ledger.recent_for_job("echo", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].message, "hi");
    }
}
