//! Persisted job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::job::{Job, JobError};
use crate::status::JobStatus;

/// Durable row describing one job instance and its lifecycle.
///
/// ## Invariants
///
/// - `start_date` is set iff `status` has left `Queued`
/// - `finish_date` is set iff `status` is terminal
/// - `start_date <= finish_date` when both are set
/// - `exception` is only set for `Failed` and `TimedOut`
///
/// All status changes go through the `mark_*` methods, which reject
/// transitions the state machine does not allow and leave the record
/// untouched in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Assigned by the store on first persist
    pub id: Option<JobId>,
    pub name: String,
    /// Registry key used to rebuild the job
    pub job_type: String,
    /// Serialized job state
    pub data: JsonValue,
    pub status: JobStatus,
    pub exception: Option<String>,
    /// Earliest instant the record may be dequeued
    pub queue_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub finish_date: Option<DateTime<Utc>>,
    /// Set when materialized from a schedule definition
    pub schedule_name: Option<String>,
    /// 0 for an original record, n for the n-th retry
    pub retry_count: u32,
}

impl JobRecord {
    /// Create a new, not yet persisted, queued record.
    pub fn new(
        job_type: impl Into<String>,
        name: impl Into<String>,
        data: JsonValue,
        queue_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            name: name.into(),
            job_type: job_type.into(),
            data,
            status: JobStatus::Queued,
            exception: None,
            queue_date,
            start_date: None,
            finish_date: None,
            schedule_name: None,
            retry_count: 0,
        }
    }

    /// Build a queued record from a live job instance.
    pub fn from_job(job: &dyn Job, queue_date: DateTime<Utc>) -> Result<Self, JobError> {
        Ok(Self::new(
            job.job_type(),
            job.name(),
            job.serialize_data()?,
            queue_date,
        ))
    }

    pub fn with_schedule(mut self, schedule_name: impl Into<String>) -> Self {
        self.schedule_name = Some(schedule_name.into());
        self
    }

    /// Fresh queued copy used to retry a failed or timed-out attempt.
    pub fn retry_of(&self, queue_date: DateTime<Utc>) -> Self {
        Self {
            id: None,
            name: self.name.clone(),
            job_type: self.job_type.clone(),
            data: self.data.clone(),
            status: JobStatus::Queued,
            exception: None,
            queue_date,
            start_date: None,
            finish_date: None,
            schedule_name: self.schedule_name.clone(),
            retry_count: self.retry_count + 1,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Claim: `Queued -> Started`.
    pub fn mark_started(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Started, at, None)
    }

    /// External cancel request: `Started -> Canceling`.
    pub fn mark_canceling(&mut self) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Canceling)?;
        self.status = JobStatus::Canceling;
        Ok(())
    }

    /// `Canceling -> Canceled`.
    pub fn mark_canceled(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Canceled, at, None)
    }

    /// `Started -> Succeeded`.
    pub fn mark_succeeded(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        self.transition(JobStatus::Succeeded, at, None)
    }

    /// `Started -> Failed`.
    pub fn mark_failed(&mut self, at: DateTime<Utc>, exception: impl Into<String>) -> DomainResult<()> {
        self.transition(JobStatus::Failed, at, Some(exception.into()))
    }

    /// `Started -> TimedOut`.
    pub fn mark_timed_out(
        &mut self,
        at: DateTime<Utc>,
        exception: impl Into<String>,
    ) -> DomainResult<()> {
        self.transition(JobStatus::TimedOut, at, Some(exception.into()))
    }

    fn ensure_transition(&self, next: JobStatus) -> DomainResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::illegal_transition(self.status, next))
        }
    }

    fn transition(
        &mut self,
        next: JobStatus,
        at: DateTime<Utc>,
        exception: Option<String>,
    ) -> DomainResult<()> {
        self.ensure_transition(next)?;

        if next == JobStatus::Started {
            self.start_date = Some(at);
        }
        if next.is_terminal() {
            // A clock step backwards must not produce finish < start.
            let finish = match self.start_date {
                Some(start) if at < start => start,
                _ => at,
            };
            self.finish_date = Some(finish);
        }
        self.exception = exception;
        self.status = next;
        Ok(())
    }

    /// Check the record-level invariants.
    ///
    /// Stores call this before persisting.
    pub fn validate(&self) -> DomainResult<()> {
        let started = self.status != JobStatus::Queued;
        if started != self.start_date.is_some() {
            return Err(DomainError::validation(format!(
                "start_date must be set iff status left queued (status: {})",
                self.status
            )));
        }
        if self.status.is_terminal() != self.finish_date.is_some() {
            return Err(DomainError::validation(format!(
                "finish_date must be set iff status is terminal (status: {})",
                self.status
            )));
        }
        if let (Some(start), Some(finish)) = (self.start_date, self.finish_date) {
            if finish < start {
                return Err(DomainError::validation("finish_date precedes start_date"));
            }
        }
        let may_carry_exception = matches!(self.status, JobStatus::Failed | JobStatus::TimedOut);
        if self.exception.is_some() && !may_carry_exception {
            return Err(DomainError::validation(format!(
                "exception is only allowed on failed/timed out records (status: {})",
                self.status
            )));
        }
        if self.job_type.trim().is_empty() {
            return Err(DomainError::validation("job_type must not be empty"));
        }
        Ok(())
    }
}
