//! One job's life cycle: lock, decide, execute, record, release.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use {
    futures::FutureExt,
    tracing::{debug, error, info, warn},
};

use crate::{
    Result,
    clock::{Clock, SystemClock},
    job::Job,
    ledger::ExecutionLedger,
    lock::LockProvider,
    schedule::{Decision, History},
    types::{ExecutionRecord, MESSAGE_MAX_LENGTH},
};

/// Modifiers for a single run attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip the schedule check. The lock still applies.
    pub force: bool,
    /// Do not log lock denials.
    pub silent: bool,
}

/// How a run attempt ended. Only `Completed` writes to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    LockDenied,
    Skipped,
    Completed(ExecutionRecord),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LockDenied => "locked",
            Self::Skipped => "not due",
            Self::Completed(record) if record.success => "succeeded",
            Self::Completed(_) => "failed",
        }
    }
}

pub struct JobRunner {
    ledger: Arc<dyn ExecutionLedger>,
    locks: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
    message_max_length: usize,
}

impl JobRunner {
    pub fn new(ledger: Arc<dyn ExecutionLedger>, locks: Arc<dyn LockProvider>) -> Self {
        Self {
            ledger,
            locks,
            clock: Arc::new(SystemClock),
            message_max_length: MESSAGE_MAX_LENGTH,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_message_max_length(mut self, max_len: usize) -> Self {
        self.message_max_length = max_len;
        self
    }

    /// Run one attempt of `job`.
    ///
    /// Failures inside the job's work are recorded, not returned. `Err` means
    /// the lock medium or the ledger failed. The lock, once taken, is
    /// released on every path, including a panic in the work.
    pub async fn run(&self, job: &dyn Job, options: RunOptions) -> Result<RunOutcome> {
        let code = job.code();

        let acquired = self.locks.acquire(code).await.inspect_err(|e| {
            error!(code, error = %e, "failed to acquire job lock");
        })?;
        if !acquired {
            if !options.silent {
                let description = match self.locks.lock_failed_description(code).await {
                    Ok(description) => description,
                    Err(e) => format!("{code}: lock has been found ({e})"),
                };
                info!(code, "{description}");
            }
            return Ok(RunOutcome::LockDenied);
        }

        let attempt = AssertUnwindSafe(self.run_locked(job, options))
            .catch_unwind()
            .await;

        let released = self.locks.release(code).await;
        if let Err(e) = &released {
            error!(code, error = %e, "failed to release job lock");
        }

        match attempt {
            Ok(outcome) => {
                let outcome = outcome?;
                released?;
                Ok(outcome)
            },
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn run_locked(&self, job: &dyn Job, options: RunOptions) -> Result<RunOutcome> {
        let code = job.code();
        let now = self.clock.now();

        let schedule_extra = if options.force {
            None
        } else {
            let history = History::new(self.ledger.as_ref(), code);
            match job.schedule().should_run_now(now, &history).await? {
                Decision::Skip => {
                    debug!(code, "job not due");
                    return Ok(RunOutcome::Skipped);
                },
                Decision::Run { schedule_extra } => schedule_extra,
            }
        };

        debug!(code, forced = options.force, "job starting");
        let mut record = ExecutionRecord::started(code, now);
        record.schedule_extra = schedule_extra;

        let result = AssertUnwindSafe(job.run()).catch_unwind().await;
        let (success, message) = match result {
            Ok(Ok(message)) => (true, message.unwrap_or_default()),
            Ok(Err(e)) => (false, non_empty(format!("{e:?}"))),
            Err(panic) => (false, non_empty(panic_message(panic.as_ref()))),
        };

        record.finished_at = Some(self.clock.now());
        record.success = success;
        record.message = job.clean_message(message, self.message_max_length);

        self.ledger.append(&record).await.inspect_err(|e| {
            error!(code, error = %e, "failed to record job outcome");
        })?;

        let duration_ms = record.duration().map_or(0, |d| d.num_milliseconds());
        if record.success {
            info!(code, duration_ms, "job completed");
        } else {
            warn!(code, duration_ms, message = %record.message, "job failed");
        }

        Ok(RunOutcome::Completed(record))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

fn non_empty(message: String) -> String {
    if message.trim().is_empty() {
        "job failed without a message".to_string()
    } else {
        message
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            cache::MemoryCache,
            clock::ManualClock,
            job::{ConfiguredJob, FnWork},
            ledger::testing::UnwritableLedger,
            ledger_memory::InMemoryLedger,
            lock_cache::CacheLock,
            lock_file::FileLock,
            schedule::Schedule,
        },
        anyhow::{Context, anyhow},
        chrono::{TimeDelta, TimeZone, Utc},
        tempfile::TempDir,
    };

    struct Harness {
        clock: Arc<ManualClock>,
        ledger: Arc<InMemoryLedger>,
        locks: Arc<CacheLock>,
        runner: JobRunner,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap(),
        ));
        let ledger = Arc::new(InMemoryLedger::new());
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let locks = Arc::new(CacheLock::new(cache, clock.clone()));
        let runner = JobRunner::new(ledger.clone(), locks.clone()).with_clock(clock.clone());
        Harness {
            clock,
            ledger,
            locks,
            runner,
        }
    }

    fn job<F, Fut>(schedule: Schedule, f: F) -> ConfiguredJob
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        ConfiguredJob::new("job", schedule, Arc::new(FnWork::new(f)))
    }

    #[tokio::test]
    async fn success_records_message_and_times() {
        let h = harness();
        let job = job(Schedule::every_minutes(5), || async { Ok(Some("42 rows".into())) });

        let outcome = h.runner.run(&job, RunOptions::default()).await.unwrap();
        let RunOutcome::Completed(record) = outcome else {
            panic!("expected a completed run");
        };
        assert!(record.success);
        assert_eq!(record.message, "42 rows");
        assert_eq!(record.started_at, h.clock.now());
        assert!(record.finished_at.is_some());
        assert_eq!(h.ledger.len(), 1);
    }

    #[tokio::test]
    async fn not_due_writes_nothing_and_releases() {
        let h = harness();
        let job = job(Schedule::every_minutes(5), || async { Ok(None) });
        h.runner.run(&job, RunOptions::default()).await.unwrap();

        h.clock.advance(TimeDelta::minutes(1));
        let outcome = h.runner.run(&job, RunOptions::default()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Skipped);
        assert_eq!(h.ledger.len(), 1);
        assert!(h.locks.acquire("job").await.unwrap());
    }

    #[tokio::test]
    async fn force_bypasses_the_schedule() {
        let h = harness();
        let job = job(Schedule::every_minutes(60), || async { Ok(None) });
        for _ in 0..3 {
            let options = RunOptions {
                force: true,
                ..Default::default()
            };
            assert!(matches!(
                h.runner.run(&job, options).await.unwrap(),
                RunOutcome::Completed(_)
            ));
        }
        assert_eq!(h.ledger.len(), 3);
    }

    #[tokio::test]
    async fn failure_records_the_cause_chain() {
        let h = harness();
        let job = job(Schedule::every_minutes(5), || async {
            Err::<Option<String>, _>(anyhow!("connection refused")).context("syncing invoices")
        });

        let outcome = h.runner.run(&job, RunOptions::default()).await.unwrap();
        let RunOutcome::Completed(record) = outcome else {
            panic!("expected a completed run");
        };
        assert!(!record.success);
        assert!(record.message.contains("syncing invoices"));
        assert!(record.message.contains("connection refused"));
        assert_eq!(outcome_label(&record), "failed");
    }

    fn outcome_label(record: &ExecutionRecord) -> &'static str {
        RunOutcome::Completed(record.clone()).label()
    }

    #[tokio::test]
    async fn panic_is_recorded_and_lock_released() {
        let h = harness();
        let job = job(Schedule::every_minutes(5), || async {
            let rows: Vec<String> = Vec::new();
            Ok(Some(rows[3].clone()))
        });

        let outcome = h.runner.run(&job, RunOptions::default()).await.unwrap();
        let RunOutcome::Completed(record) = outcome else {
            panic!("expected a completed run");
        };
        assert!(!record.success);
        assert!(record.message.contains("index out of bounds"));
        assert!(h.locks.acquire("job").await.unwrap());
    }

    #[tokio::test]
    async fn held_lock_denies_without_a_record() {
        let h = harness();
        assert!(h.locks.acquire("job").await.unwrap());
        let job = job(Schedule::every_minutes(5), || async { Ok(None) });

        let outcome = h.runner.run(&job, RunOptions::default()).await.unwrap();
        assert_eq!(outcome, RunOutcome::LockDenied);
        assert!(h.ledger.is_empty());
        // Denial must not release someone else's lock.
        assert!(!h.locks.acquire("job").await.unwrap());
    }

    #[tokio::test]
    async fn ledger_failure_propagates_and_releases_the_lock() {
        let tmp = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2014, 1, 1, 0, 0, 0).unwrap(),
        ));
        let locks = Arc::new(FileLock::new(tmp.path().to_path_buf(), clock.clone()));
        let runner =
            JobRunner::new(Arc::new(UnwritableLedger), locks.clone()).with_clock(clock.clone());
        let job = job(Schedule::every_minutes(5), || async { Ok(Some("done".into())) });

        let err = runner.run(&job, RunOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("disk full"), "{err}");
        assert!(!locks.lock_path("job").exists());
        assert!(locks.acquire("job").await.unwrap());
    }

    #[tokio::test]
    async fn long_messages_keep_their_tail() {
        let h = harness();
        let runner = JobRunner::new(h.ledger.clone(), h.locks.clone())
            .with_clock(h.clock.clone())
            .with_message_max_length(4);
        let job = job(Schedule::every_minutes(5), || async { Ok(Some("abcdefgh".into())) });

        runner.run(&job, RunOptions::default()).await.unwrap();
        assert_eq!(h.ledger.records()[0].message, "efgh");
    }

    #[tokio::test]
    async fn fixed_runs_are_tagged_with_their_slot() {
        let h = harness();
        h.clock.advance(TimeDelta::hours(9));
        let job = job(Schedule::at_times(&["08:30"]).unwrap(), || async { Ok(None) });

        h.runner.run(&job, RunOptions::default()).await.unwrap();
        assert_eq!(h.ledger.records()[0].schedule_extra.as_deref(), Some("08:30"));
    }

    #[test]
    fn panic_payloads_are_rendered() {
        assert_eq!(panic_message(&"boom"), "panicked: boom");
        assert_eq!(panic_message(&String::from("bang")), "panicked: bang");
        assert_eq!(panic_message(&7_u8), "panicked");
        assert_eq!(non_empty(" ".into()), "job failed without a message");
    }
}
