//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use jobforge_core::{JobId, JobRecord, JobStatus};

use super::store::{JobStats, JobStore, JobStoreError, Reconcile};

/// In-memory job store.
///
/// A single write lock is held for the whole of every phase, which gives the
/// same claim exclusivity a SQL backend gets from its transaction. Not
/// durable; intended for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    /// Hand every record with `status` among `active` to `reconcile`.
    fn reconcile_active(
        &self,
        status: JobStatus,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut jobs = self.write()?;

        let mut candidates: Vec<JobRecord> = active
            .iter()
            .filter_map(|id| jobs.get(id))
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        candidates.sort_by_key(|r| r.queue_date);

        let changed = apply(candidates, reconcile)?;
        commit(&mut jobs, &changed);
        Ok(changed)
    }
}

/// Run `reconcile` over `records` and validate the ones it wants persisted.
fn apply(records: Vec<JobRecord>, reconcile: Reconcile<'_>) -> Result<Vec<JobRecord>, JobStoreError> {
    let mut changed = Vec::with_capacity(records.len());
    for mut record in records {
        if reconcile(&mut record) {
            record
                .validate()
                .map_err(|e| JobStoreError::Invalid(e.to_string()))?;
            changed.push(record);
        }
    }
    Ok(changed)
}

fn commit(jobs: &mut HashMap<JobId, JobRecord>, records: &[JobRecord]) {
    for record in records {
        if let Some(id) = record.id {
            jobs.insert(id, record.clone());
        }
    }
}

impl JobStore for InMemoryJobStore {
    fn create_job(&self, mut record: JobRecord) -> Result<JobRecord, JobStoreError> {
        if let Some(id) = record.id {
            return Err(JobStoreError::AlreadyExists(id));
        }
        if record.status != JobStatus::Queued {
            return Err(JobStoreError::Invalid(format!(
                "new records must be queued, got {}",
                record.status
            )));
        }
        record
            .validate()
            .map_err(|e| JobStoreError::Invalid(e.to_string()))?;

        let mut jobs = self.write()?;
        let id = JobId::new();
        record.id = Some(id);
        jobs.insert(id, record.clone());
        Ok(record)
    }

    fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    fn dequeue_jobs(
        &self,
        max: usize,
        now: DateTime<Utc>,
        claim: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut jobs = self.write()?;

        // Oldest first; ties broken by id (UUIDv7, creation order).
        let mut candidates: Vec<&JobRecord> = jobs
            .values()
            .filter(|r| r.status == JobStatus::Queued && r.queue_date <= now)
            .collect();
        candidates.sort_by_key(|r| (r.queue_date, r.id));
        let batch: Vec<JobRecord> = candidates.into_iter().take(max).cloned().collect();

        let claimed = apply(batch, claim)?;
        commit(&mut jobs, &claimed);
        Ok(claimed)
    }

    fn canceling_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.reconcile_active(JobStatus::Canceling, active, reconcile)
    }

    fn running_jobs(
        &self,
        active: &[JobId],
        reconcile: Reconcile<'_>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.reconcile_active(JobStatus::Started, active, reconcile)
    }

    fn update_jobs(
        &self,
        records: Vec<JobRecord>,
        mutate: Option<Reconcile<'_>>,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let mut jobs = self.write()?;

        for record in &records {
            let id = record
                .id
                .ok_or_else(|| JobStoreError::Invalid("record has no id".to_string()))?;
            if !jobs.contains_key(&id) {
                return Err(JobStoreError::NotFound(id));
            }
        }

        let changed = match mutate {
            Some(mutate) => {
                let current: Vec<JobRecord> = records
                    .iter()
                    .filter_map(|r| r.id.and_then(|id| jobs.get(&id)).cloned())
                    .collect();
                apply(current, mutate)?
            }
            None => apply(records, &mut |_| true)?,
        };
        commit(&mut jobs, &changed);
        Ok(changed)
    }

    fn delete_jobs(&self, job_ids: &[JobId]) -> Result<usize, JobStoreError> {
        let mut jobs = self.write()?;
        Ok(job_ids.iter().filter(|id| jobs.remove(*id).is_some()).count())
    }

    fn latest_scheduled_job(&self, schedule_name: &str) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|r| r.schedule_name.as_deref() == Some(schedule_name))
            .max_by_key(|r| (r.queue_date, r.id))
            .cloned())
    }

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let jobs = self.read()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.queue_date, r.id));
        result.truncate(limit);
        Ok(result)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for record in jobs.values() {
            stats.count(record.status);
        }
        Ok(stats)
    }
}
