//! Job store boundary.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use jobforge_core::{Job, JobId, JobRecord, JobStatus};

/// Callback handed to phase-scoped store operations.
///
/// The callback may mutate the record; returning `true` asks the store to
/// persist it, `false` leaves the stored row untouched.
pub type Reconcile<'a> = &'a mut dyn FnMut(&mut JobRecord) -> bool;

/// Job store abstraction.
///
/// The store is the only component that reads or writes job records. Every
/// operation is a self-contained transaction: rows are selected, handed to
/// the caller's callback, persisted, and only then returned.
///
/// ## Implementation Requirements
///
/// - `dequeue_jobs` must claim atomically: a record returned by one call can
///   never be returned by another call, even from another process sharing
///   the same backend
/// - batch writes (`update_jobs`, and the rows persisted by a phase) commit
///   as one unit or not at all
/// - records are validated (`JobRecord::validate`) before they are persisted
pub trait JobStore: Send + Sync {
    /// Persist a new queued record and assign its id.
    fn create_job(&self, record: JobRecord) -> Result<JobRecord, JobStoreError>;

    /// Get a record by ID.
    fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Claim up to `max` queued records whose `queue_date <= now`, oldest first.
    ///
    /// `claim` is expected to move each record to `Started`; the claimed
    /// records are returned after they have been persisted.
    fn dequeue_jobs(
        &self,
        max: usize,
        now: DateTime<Utc>,
        claim: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Reconcile `Canceling` records among `active`; returns the persisted ones.
    fn canceling_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Reconcile `Started` records among `active`; returns the persisted ones.
    fn running_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Persist a batch all-or-nothing.
    ///
    /// Without `mutate` the given records are written as-is. With `mutate`
    /// the records only identify rows: the callback runs against the current
    /// stored version of each, inside the same transaction.
    fn update_jobs(
        &self,
        records: Vec<JobRecord>,
        mutate: Option<Reconcile<'_>>,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Delete records; returns how many existed.
    fn delete_jobs(&self, job_ids: &[JobId]) -> Result<usize, JobStoreError>;

    /// The record of a schedule with the latest `queue_date`, if any.
    fn latest_scheduled_job(&self, schedule_name: &str) -> Result<Option<JobRecord>, JobStoreError>;

    /// List records ordered by `queue_date`, optionally filtered by status.
    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Count records per status.
    fn stats(&self) -> Result<JobStats, JobStoreError>;

    /// Build a queued record from `job` and persist it.
    fn enqueue(&self, job: &dyn Job) -> Result<JobRecord, JobStoreError> {
        let record = JobRecord::from_job(job, Utc::now())
            .map_err(|e| JobStoreError::Serialization(e.to_string()))?;
        self.create_job(record)
    }

    /// Ask the runner owning a started job to cancel it (`Started -> Canceling`).
    fn request_cancel(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        let record = self
            .get_job(job_id)?
            .ok_or(JobStoreError::NotFound(job_id))?;

        let mut rejected = None;
        let mut updated = self.update_jobs(
            vec![record],
            Some(&mut |r: &mut JobRecord| match r.mark_canceling() {
                Ok(()) => true,
                Err(e) => {
                    rejected = Some(e);
                    false
                }
            }),
        )?;

        if let Some(e) = rejected {
            return Err(JobStoreError::Invalid(e.to_string()));
        }
        updated.pop().ok_or(JobStoreError::NotFound(job_id))
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job record: {0}")]
    Invalid(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Record counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub started: usize,
    pub canceling: usize,
    pub canceled: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl JobStats {
    pub fn count(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Queued => self.queued += n,
            JobStatus::Started => self.started += n,
            JobStatus::Canceling => self.canceling += n,
            JobStatus::Canceled => self.canceled += n,
            JobStatus::Succeeded => self.succeeded += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::TimedOut => self.timed_out += n,
        }
    }

    /// Count for a single status.
    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Queued => self.queued,
            JobStatus::Started => self.started,
            JobStatus::Canceling => self.canceling,
            JobStatus::Canceled => self.canceled,
            JobStatus::Succeeded => self.succeeded,
            JobStatus::Failed => self.failed,
            JobStatus::TimedOut => self.timed_out,
        }
    }

    pub fn total(&self) -> usize {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create_job(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
        (**self).create_job(record)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).get_job(job_id)
    }

    fn dequeue_jobs(
        &self,
        max: usize,
        now: DateTime<Utc>,
        claim: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).dequeue_jobs(max, now, claim)
    }

    fn canceling_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).canceling_jobs(active, reconcile)
    }

    fn running_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).running_jobs(active, reconcile)
    }

    fn update_jobs(
        &self,
        records: Vec<JobRecord>,
        mutate: Option<Reconcile<'_>>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).update_jobs(records, mutate)
    }

    fn delete_jobs(&self, job_ids: &[JobId]) -> Result<usize, JobStoreError> {
        (**self).delete_jobs(job_ids)
    }

    fn latest_scheduled_job(&self, schedule_name: &str) -> Result<Option<JobRecord>, JobStoreError> {
        (**self).latest_scheduled_job(schedule_name)
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        (**self).list_jobs(status, limit)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}
