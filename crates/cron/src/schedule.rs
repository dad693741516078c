//! Run/no-run decisions for periodic and fixed-time schedules.
//!
//! Schedules hold no run-time state. Every input comes from the ledger at
//! evaluation time, through a [`History`] scoped to one run attempt.

use {
    chrono::{DateTime, Datelike, NaiveTime, TimeDelta, TimeZone, Utc, Weekday},
    chrono_tz::Tz,
    serde::{Deserialize, Serialize},
    tokio::sync::OnceCell,
};

use crate::{Error, Result, ledger::ExecutionLedger, types::ExecutionRecord};

const SLOT_FORMAT: &str = "%H:%M";

/// What a schedule decided for the current attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip,
    Run {
        /// Marker persisted with the record (fixed schedules only).
        schedule_extra: Option<String>,
    },
}

impl Decision {
    #[must_use]
    pub fn should_run(&self) -> bool {
        matches!(self, Self::Run { .. })
    }
}

/// Ledger queries for one job, computed lazily and memoized for the
/// lifetime of a single run attempt.
pub struct History<'a> {
    ledger: &'a dyn ExecutionLedger,
    code: &'a str,
    last: OnceCell<Option<ExecutionRecord>>,
    last_success: OnceCell<Option<ExecutionRecord>>,
}

impl<'a> History<'a> {
    pub fn new(ledger: &'a dyn ExecutionLedger, code: &'a str) -> Self {
        Self {
            ledger,
            code,
            last: OnceCell::new(),
            last_success: OnceCell::new(),
        }
    }

    /// Latest record by start time, regardless of outcome.
    pub async fn last_record(&self) -> Result<Option<&ExecutionRecord>> {
        let record = self
            .last
            .get_or_try_init(|| self.ledger.latest_for_job(self.code))
            .await?;
        Ok(record.as_ref())
    }

    /// Latest successful record that no fixed-time slot claimed.
    pub async fn last_successful_record(&self) -> Result<Option<&ExecutionRecord>> {
        let record = self
            .last_success
            .get_or_try_init(|| self.ledger.latest_successful_for_job(self.code, true))
            .await?;
        Ok(record.as_ref())
    }

    pub async fn count_started_since(&self, since: DateTime<Utc>) -> Result<u64> {
        self.ledger.count_started_since(self.code, since).await
    }
}

/// Fire every `interval` since the last success, retrying failures sooner
/// when `retry_after_failure` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Periodic {
    interval: TimeDelta,
    retry_after_failure: Option<TimeDelta>,
}

impl Periodic {
    #[must_use]
    pub fn every_minutes(minutes: u32) -> Self {
        Self {
            interval: TimeDelta::minutes(i64::from(minutes)),
            retry_after_failure: None,
        }
    }

    /// A zero delay counts as unset: failures then wait out the full interval.
    #[must_use]
    pub fn retry_after_failure_minutes(mut self, minutes: u32) -> Self {
        self.retry_after_failure =
            (minutes > 0).then(|| TimeDelta::minutes(i64::from(minutes)));
        self
    }

    #[must_use]
    pub fn interval(&self) -> TimeDelta {
        self.interval
    }

    #[must_use]
    pub fn retry_after_failure(&self) -> Option<TimeDelta> {
        self.retry_after_failure
    }

    pub async fn should_run_now(&self, now: DateTime<Utc>, history: &History<'_>) -> Result<bool> {
        // A failed last run is retried on the shorter delay, never waited out.
        if let Some(retry) = self.retry_after_failure
            && let Some(last) = history.last_record().await?
            && !last.success
        {
            return Ok(now > last.started_at + retry);
        }

        match history.last_successful_record().await? {
            Some(last_success) => Ok(now > last_success.started_at + self.interval),
            None => Ok(true),
        }
    }
}

/// Fire at given clock times each day, optionally only on some weekdays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fixed {
    times: Vec<NaiveTime>,
    days_of_week: Option<Vec<Weekday>>,
    timezone: Tz,
}

impl Fixed {
    /// Parse `HH:MM` times. They are kept in ascending order; duplicate
    /// times are left as given and misalign slot indexes.
    pub fn at_times<S: AsRef<str>>(times: &[S]) -> Result<Self> {
        if times.is_empty() {
            return Err(Error::invalid_schedule("run_at_times must not be empty"));
        }
        let mut parsed = times
            .iter()
            .map(|t| parse_hhmm(t.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        parsed.sort();
        Ok(Self {
            times: parsed,
            days_of_week: None,
            timezone: chrono_tz::UTC,
        })
    }

    #[must_use]
    pub fn on_days(mut self, days: impl IntoIterator<Item = Weekday>) -> Self {
        self.days_of_week = Some(days.into_iter().collect());
        self
    }

    #[must_use]
    pub fn in_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    #[must_use]
    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    pub async fn should_run_now(
        &self,
        now: DateTime<Utc>,
        history: &History<'_>,
    ) -> Result<Option<NaiveTime>> {
        let local_now = now.with_timezone(&self.timezone);

        if let Some(days) = &self.days_of_week
            && !days.contains(&local_now.weekday())
        {
            return Ok(None);
        }

        // Any run today, forced or failed, consumes one slot in order, so the
        // only candidate is the slot whose index equals today's run count.
        let ran_today = history.count_started_since(self.start_of_day(now)).await?;
        let Ok(index) = usize::try_from(ran_today) else {
            return Ok(None);
        };
        Ok(self
            .times
            .get(index)
            .copied()
            .filter(|slot| local_now.time() >= *slot))
    }

    /// Midnight of `now`'s local date, as a UTC instant.
    fn start_of_day(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.timezone);
        let midnight = local_now.date_naive().and_time(NaiveTime::MIN);
        match self.timezone.from_local_datetime(&midnight).earliest() {
            Some(start) => start.with_timezone(&Utc),
            // Midnight skipped by a DST jump: count back the wall-clock time.
            None => now - local_now.time().signed_duration_since(NaiveTime::MIN),
        }
    }
}

/// A job's schedule. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Periodic(Periodic),
    Fixed(Fixed),
}

impl Schedule {
    #[must_use]
    pub fn every_minutes(minutes: u32) -> Self {
        Self::Periodic(Periodic::every_minutes(minutes))
    }

    pub fn at_times<S: AsRef<str>>(times: &[S]) -> Result<Self> {
        Ok(Self::Fixed(Fixed::at_times(times)?))
    }

    pub async fn should_run_now(
        &self,
        now: DateTime<Utc>,
        history: &History<'_>,
    ) -> Result<Decision> {
        match self {
            Self::Periodic(periodic) => Ok(if periodic.should_run_now(now, history).await? {
                Decision::Run {
                    schedule_extra: None,
                }
            } else {
                Decision::Skip
            }),
            Self::Fixed(fixed) => Ok(match fixed.should_run_now(now, history).await? {
                Some(slot) => Decision::Run {
                    schedule_extra: Some(slot.format(SLOT_FORMAT).to_string()),
                },
                None => Decision::Skip,
            }),
        }
    }
}

impl From<Periodic> for Schedule {
    fn from(value: Periodic) -> Self {
        Self::Periodic(value)
    }
}

impl From<Fixed> for Schedule {
    fn from(value: Fixed) -> Self {
        Self::Fixed(value)
    }
}

/// Configuration shape of a schedule: one table carrying the fields of both
/// variants. [`ScheduleSpec::into_schedule`] picks the variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_every_mins: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_failure_mins: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at_times: Option<Vec<String>>,
    /// 0 = Monday … 6 = Sunday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_of_week: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

impl ScheduleSpec {
    /// `run_every_mins` wins when both forms are present.
    pub fn into_schedule(self) -> Result<Schedule> {
        if let Some(minutes) = self.run_every_mins {
            let periodic = Periodic::every_minutes(minutes)
                .retry_after_failure_minutes(self.retry_after_failure_mins.unwrap_or(0));
            return Ok(periodic.into());
        }

        let Some(times) = self.run_at_times else {
            return Err(Error::invalid_schedule(
                "expected `run_every_mins` or `run_at_times`",
            ));
        };
        let mut fixed = Fixed::at_times(&times)?;
        if let Some(days) = self.days_of_week {
            let days = days
                .into_iter()
                .map(weekday_from_index)
                .collect::<Result<Vec<_>>>()?;
            fixed = fixed.on_days(days);
        }
        if let Some(name) = self.timezone {
            let tz: Tz = name
                .parse()
                .map_err(|_| Error::unknown_timezone(name.as_str()))?;
            fixed = fixed.in_timezone(tz);
        }
        Ok(fixed.into())
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), SLOT_FORMAT)
        .map_err(|e| Error::invalid_schedule(format!("invalid time `{s}` (expected HH:MM): {e}")))
}

fn weekday_from_index(index: u8) -> Result<Weekday> {
    Ok(match index {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        6 => Weekday::Sun,
        _ => {
            return Err(Error::invalid_schedule(format!(
                "day of week must be 0-6 (Monday = 0), got {index}"
            )));
        },
    })
}
