//! Turns raw `[[jobs]]` configuration entries into runnable jobs, checking
//! every entry up front. Each failure kind has a stable id.

use std::{collections::BTreeMap, fmt, sync::Arc};

use {
    serde_json::{Map, Value},
    thiserror::Error,
};

use crate::{
    job::{CommandWork, ConfiguredJob, Job, JobWork},
    schedule::ScheduleSpec,
};

/// Kind used when an entry does not name one.
pub const DEFAULT_KIND: &str = "command";

/// Builds the work for one entry of a given kind, or explains what is missing.
pub type WorkFactory =
    Arc<dyn Fn(&Map<String, Value>) -> Result<Arc<dyn JobWork>, String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationErrorKind {
    UnresolvableReference,
    WrongBaseType,
    MissingCode,
    NonStringCode,
    MissingSchedule,
    InvalidSchedule,
    MissingWork,
    DuplicateCode,
}

impl RegistrationErrorKind {
    pub fn id(self) -> &'static str {
        match self {
            Self::UnresolvableReference => "cadence.E001",
            Self::WrongBaseType => "cadence.E002",
            Self::MissingCode => "cadence.E003",
            Self::NonStringCode => "cadence.E004",
            Self::MissingSchedule => "cadence.E005",
            Self::InvalidSchedule => "cadence.E006",
            Self::MissingWork => "cadence.E007",
            Self::DuplicateCode => "cadence.E008",
        }
    }

    fn summary(self) -> &'static str {
        match self {
            Self::UnresolvableReference => "could not resolve the job kind",
            Self::WrongBaseType => "job entries must be tables",
            Self::MissingCode => "jobs must define a `code`",
            Self::NonStringCode => "job codes must be strings",
            Self::MissingSchedule => "jobs must define a `schedule`",
            Self::InvalidSchedule => "the schedule cannot decide when to run",
            Self::MissingWork => "jobs must define the work to do",
            Self::DuplicateCode => "job codes must be unique",
        }
    }
}

impl fmt::Display for RegistrationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{kind}] {object}: {}{}", .kind.summary(), .hint.as_deref().map(|h| format!(" ({h})")).unwrap_or_default())]
pub struct RegistrationError {
    pub kind: RegistrationErrorKind,
    /// Which entry failed, e.g. `jobs[2]`.
    pub object: String,
    pub hint: Option<String>,
}

impl RegistrationError {
    fn new(kind: RegistrationErrorKind, index: usize, hint: Option<String>) -> Self {
        Self {
            kind,
            object: format!("jobs[{index}]"),
            hint,
        }
    }
}

/// Known job kinds and the factories that build their work.
pub struct JobRegistry {
    kinds: BTreeMap<String, WorkFactory>,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl JobRegistry {
    /// A registry with no kinds at all.
    pub fn new() -> Self {
        Self {
            kinds: BTreeMap::new(),
        }
    }

    /// A registry with the `command` kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DEFAULT_KIND, Arc::new(command_work));
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, factory: WorkFactory) {
        self.kinds.insert(kind.into(), factory);
    }

    /// Check entries without keeping the built jobs.
    pub fn validate(&self, entries: &[Value]) -> Vec<RegistrationError> {
        self.build(entries).err().unwrap_or_default()
    }

    /// Build every entry, or report every problem found across all of them.
    pub fn build(&self, entries: &[Value]) -> Result<Vec<Arc<dyn Job>>, Vec<RegistrationError>> {
        let mut errors = Vec::new();
        let mut jobs: Vec<Arc<dyn Job>> = Vec::new();
        let mut codes: BTreeMap<String, Vec<usize>> = BTreeMap::new();

        for (index, entry) in entries.iter().enumerate() {
            let mut fail = |kind, hint: Option<String>| {
                errors.push(RegistrationError::new(kind, index, hint));
            };

            let Some(table) = entry.as_object() else {
                fail(RegistrationErrorKind::WrongBaseType, None);
                continue;
            };

            let factory = match table.get("kind") {
                None => self.kinds.get(DEFAULT_KIND),
                Some(Value::String(kind)) => self.kinds.get(kind),
                Some(_) => None,
            };
            let Some(factory) = factory else {
                let kind = table.get("kind").map_or(DEFAULT_KIND.to_string(), Value::to_string);
                fail(
                    RegistrationErrorKind::UnresolvableReference,
                    Some(format!("unknown kind {kind}")),
                );
                continue;
            };

            let code = match table.get("code") {
                None => {
                    fail(RegistrationErrorKind::MissingCode, None);
                    None
                },
                Some(Value::String(code)) => {
                    codes.entry(code.clone()).or_default().push(index);
                    Some(code.clone())
                },
                Some(other) => {
                    fail(RegistrationErrorKind::NonStringCode, Some(format!("got {other}")));
                    None
                },
            };

            let schedule = match table.get("schedule") {
                None => {
                    fail(RegistrationErrorKind::MissingSchedule, None);
                    None
                },
                Some(value) => match serde_json::from_value::<ScheduleSpec>(value.clone())
                    .map_err(|e| e.to_string())
                    .and_then(|spec| spec.into_schedule().map_err(|e| e.to_string()))
                {
                    Ok(schedule) => Some(schedule),
                    Err(e) => {
                        fail(RegistrationErrorKind::InvalidSchedule, Some(e));
                        None
                    },
                },
            };

            let work = match factory(table) {
                Ok(work) => Some(work),
                Err(hint) => {
                    fail(RegistrationErrorKind::MissingWork, Some(hint));
                    None
                },
            };

            if let (Some(code), Some(schedule), Some(work)) = (code, schedule, work) {
                jobs.push(Arc::new(ConfiguredJob::new(code, schedule, work)));
            }
        }

        for (code, indexes) in codes {
            if let [first, rest @ ..] = indexes.as_slice()
                && !rest.is_empty()
            {
                let objects: Vec<String> = indexes.iter().map(|i| format!("jobs[{i}]")).collect();
                errors.push(RegistrationError::new(
                    RegistrationErrorKind::DuplicateCode,
                    *first,
                    Some(format!("`{code}` is defined by {}", objects.join(", "))),
                ));
            }
        }

        if errors.is_empty() {
            Ok(jobs)
        } else {
            Err(errors)
        }
    }
}

fn command_work(table: &Map<String, Value>) -> Result<Arc<dyn JobWork>, String> {
    match table.get("command") {
        Some(Value::String(command)) if !command.trim().is_empty() => {
            Ok(Arc::new(CommandWork::new(command.clone())))
        },
        Some(_) => Err("`command` must be a non-empty string".to_string()),
        None => Err("command jobs need a `command`".to_string()),
    }
}
