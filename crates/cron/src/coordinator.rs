//! Runs a selection of configured jobs, one after another.

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, info};

use crate::{
    Error, Result,
    job::Job,
    runner::{JobRunner, RunOptions, RunOutcome},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub code: String,
    pub outcome: RunOutcome,
}

pub struct Coordinator {
    runner: JobRunner,
    jobs: Vec<Arc<dyn Job>>,
}

impl Coordinator {
    pub fn new(runner: JobRunner, jobs: Vec<Arc<dyn Job>>) -> Self {
        Self { runner, jobs }
    }

    /// Resolve `codes` to jobs, in the order given. An empty selection means
    /// every configured job. Any unknown code fails the whole selection.
    pub fn select(&self, codes: &[String]) -> Result<Vec<Arc<dyn Job>>> {
        if codes.is_empty() {
            return Ok(self.jobs.clone());
        }

        let mut selected = Vec::with_capacity(codes.len());
        let mut unknown = Vec::new();
        let mut seen = HashSet::new();
        for code in codes {
            if !seen.insert(code.as_str()) {
                continue;
            }
            match self.jobs.iter().find(|job| job.code() == code) {
                Some(job) => selected.push(Arc::clone(job)),
                None => unknown.push(code.clone()),
            }
        }

        if !unknown.is_empty() {
            return Err(Error::UnknownJobs { codes: unknown });
        }
        Ok(selected)
    }

    /// Run the selected jobs. A job whose work fails does not stop the
    /// others; a ledger or lock failure stops the whole invocation.
    pub async fn run(&self, codes: &[String], options: RunOptions) -> Result<Vec<JobReport>> {
        let jobs = self.select(codes)?;
        debug!(count = jobs.len(), force = options.force, "running jobs");

        let mut reports = Vec::with_capacity(jobs.len());
        for job in jobs {
            let outcome = self.runner.run(job.as_ref(), options).await?;
            reports.push(JobReport {
                code: job.code().to_string(),
                outcome,
            });
        }

        let completed = reports
            .iter()
            .filter(|r| matches!(r.outcome, RunOutcome::Completed(_)))
            .count();
        info!(selected = reports.len(), completed, "run finished");
        Ok(reports)
    }
}
