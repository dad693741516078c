//! The job contract and its stock implementations.

use std::{pin::Pin, sync::Arc};

use {anyhow::bail, async_trait::async_trait, tokio::process::Command};

use crate::{schedule::Schedule, types::truncate_message};

/// The work a job performs. `Ok(Some(msg))` is recorded as the outcome
/// message; an error is recorded with its full cause chain.
#[async_trait]
pub trait JobWork: Send + Sync {
    async fn run(&self) -> anyhow::Result<Option<String>>;
}

/// A schedulable unit of work identified by a unique code.
#[async_trait]
pub trait Job: Send + Sync {
    fn code(&self) -> &str;

    fn schedule(&self) -> &Schedule;

    async fn run(&self) -> anyhow::Result<Option<String>>;

    /// Shape the outcome message before it is persisted.
    fn clean_message(&self, message: String, max_len: usize) -> String {
        truncate_message(message, max_len)
    }
}

/// A job assembled from parts, as built by the registry.
pub struct ConfiguredJob {
    code: String,
    schedule: Schedule,
    work: Arc<dyn JobWork>,
}

impl ConfiguredJob {
    pub fn new(code: impl Into<String>, schedule: Schedule, work: Arc<dyn JobWork>) -> Self {
        Self {
            code: code.into(),
            schedule,
            work,
        }
    }
}

#[async_trait]
impl Job for ConfiguredJob {
    fn code(&self) -> &str {
        &self.code
    }

    fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    async fn run(&self) -> anyhow::Result<Option<String>> {
        self.work.run().await
    }
}

pub type WorkFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send>>;

/// Work backed by an async closure.
pub struct FnWork {
    f: Arc<dyn Fn() -> WorkFuture + Send + Sync>,
}

impl FnWork {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<String>>> + Send + 'static,
    {
        Self {
            f: Arc::new(move || Box::pin(f())),
        }
    }
}

#[async_trait]
impl JobWork for FnWork {
    async fn run(&self) -> anyhow::Result<Option<String>> {
        (self.f)().await
    }
}

/// Work that runs a shell command through `sh -c`.
pub struct CommandWork {
    command: String,
}

impl CommandWork {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl JobWork for CommandWork {
    async fn run(&self) -> anyhow::Result<Option<String>> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("`{}` exited with {}: {}", self.command, output.status, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!stdout.is_empty()).then_some(stdout))
    }
}
