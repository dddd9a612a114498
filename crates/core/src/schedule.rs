//! Recurring schedule definitions and occurrence computation.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::job::JobMetadata;

/// Repeat period of a schedule.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatType {
    Hourly,
    Daily,
    Weekly,
}

impl RepeatType {
    pub fn period(&self) -> TimeDelta {
        TimeDelta::seconds(self.period_secs())
    }

    fn period_secs(&self) -> i64 {
        match self {
            RepeatType::Hourly => 60 * 60,
            RepeatType::Daily => 24 * 60 * 60,
            RepeatType::Weekly => 7 * 24 * 60 * 60,
        }
    }
}

/// A recurring job, loaded from configuration and never mutated at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Unique schedule name, stamped on every materialized record
    pub name: String,
    /// Anchor of the first occurrence (UTC)
    pub start_on: DateTime<Utc>,
    pub repeat: RepeatType,
    /// Registry key of the job to materialize
    pub job_type: String,
    /// Passed to the job constructor on every occurrence
    #[serde(default)]
    pub metadata: JobMetadata,
}

impl ScheduleDefinition {
    pub fn new(
        name: impl Into<String>,
        start_on: DateTime<Utc>,
        repeat: RepeatType,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            start_on,
            repeat,
            job_type: job_type.into(),
            metadata: JobMetadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("schedule name must not be empty"));
        }
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation(format!(
                "schedule '{}' has an empty job_type",
                self.name
            )));
        }
        Ok(())
    }

    /// See [`next_execute_date`].
    pub fn next_execute_date(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        next_execute_date(self, now)
    }
}

/// Next occurrence of `schedule` at or after `now`.
///
/// Before the anchor this is the anchor itself. Afterwards it is
/// `start_on + ceil((now - start_on) / period) * period`, so a `now` that lands
/// exactly on an occurrence returns `now`.
pub fn next_execute_date(schedule: &ScheduleDefinition, now: DateTime<Utc>) -> DateTime<Utc> {
    if now < schedule.start_on {
        return schedule.start_on;
    }

    let elapsed = now - schedule.start_on;
    let elapsed_nanos =
        i128::from(elapsed.num_seconds()) * 1_000_000_000 + i128::from(elapsed.subsec_nanos());
    let period_secs = schedule.repeat.period_secs();
    let period_nanos = i128::from(period_secs) * 1_000_000_000;

    // elapsed >= 0 here, so this is an exact integer ceil.
    let occurrences = (elapsed_nanos + period_nanos - 1) / period_nanos;
    let offset_secs = occurrences as i64 * period_secs;

    schedule.start_on + TimeDelta::seconds(offset_secs)
}
