//! Heartbeat coordinator.
//!
//! A `JobRunner` owns the set of active runs and, once per heartbeat, walks
//! the store through five phases in strict order:
//!
//! 1. cancel: abort runs whose record was moved to `Canceling`
//! 2. finish: persist the outcome of runs that completed
//! 3. timeout: abort runs that exceeded their job's timeout
//! 4. dequeue: claim queued records up to the free capacity and start them
//! 5. schedules: materialize the next occurrence of each schedule
//!
//! A failing phase is logged, reported to the observer and skipped; the next
//! heartbeat tries again.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use jobforge_core::{DomainError, JobId, JobRecord, JobRegistry, JobStatus};

use super::observer::{JobRunnerObserver, NoopObserver, notify};
use super::run::JobRun;
use super::store::{JobStore, JobStoreError};
use crate::config::{ConfigError, RunnerConfig};

/// Job runner error.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("cannot construct job: {0}")]
    Resolve(#[from] DomainError),
    #[error("schedule '{schedule}' references unregistered job type '{job_type}'")]
    UnknownScheduleJobType { schedule: String, job_type: String },
    #[error("duplicate schedule name: {0}")]
    DuplicateSchedule(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

type Phase<S> = fn(&mut JobRunner<S>) -> Result<(), RunnerError>;

/// Heartbeat-driven job coordinator.
///
/// The runner is constructed stopped; `start` lets heartbeats do work,
/// `stop` pauses them without touching runs already in flight.
pub struct JobRunner<S: JobStore> {
    store: S,
    registry: Arc<JobRegistry>,
    config: RunnerConfig,
    observer: Arc<dyn JobRunnerObserver>,
    running: Arc<AtomicBool>,
    active: HashMap<JobId, JobRun>,
}

impl<S: JobStore> JobRunner<S> {
    pub fn new(
        store: S,
        registry: Arc<JobRegistry>,
        config: RunnerConfig,
    ) -> Result<Self, RunnerError> {
        config.validate()?;

        let mut names = HashSet::new();
        for schedule in &config.schedules {
            if !names.insert(schedule.name.as_str()) {
                return Err(RunnerError::DuplicateSchedule(schedule.name.clone()));
            }
            if !registry.contains(&schedule.job_type) {
                return Err(RunnerError::UnknownScheduleJobType {
                    schedule: schedule.name.clone(),
                    job_type: schedule.job_type.clone(),
                });
            }
        }

        Ok(Self {
            store,
            registry,
            config,
            observer: Arc::new(NoopObserver),
            running: Arc::new(AtomicBool::new(false)),
            active: HashMap::new(),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn JobRunnerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of runs currently tracked.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.active.contains_key(&job_id)
    }

    /// Run one heartbeat synchronously. Does nothing while stopped.
    pub fn heartbeat(&mut self) {
        if !self.is_running() {
            return;
        }

        let phases: [(&str, Phase<S>); 5] = [
            ("cancel", Self::cancel_phase),
            ("finish", Self::finish_phase),
            ("timeout", Self::timeout_phase),
            ("dequeue", Self::dequeue_phase),
            ("schedules", Self::schedule_phase),
        ];

        for (phase, run) in phases {
            if let Err(e) = run(self) {
                error!(phase, error = %e, "job runner phase failed");
                self.report_error(None, Some(&e));
            }
        }
    }

    fn active_ids(&self) -> Vec<JobId> {
        self.active.keys().copied().collect()
    }

    fn cancel_phase(&mut self) -> Result<(), RunnerError> {
        if self.active.is_empty() {
            return Ok(());
        }

        let ids = self.active_ids();
        let mut requested = Vec::new();
        self.store
            .canceling_jobs(&ids, &mut |record: &mut JobRecord| {
                requested.extend(record.id);
                false
            })?;
        if requested.is_empty() {
            return Ok(());
        }

        // Aborts wait outside the store so host calls are never held up.
        let grace = self.config.abort_grace();
        let stopped: HashMap<JobId, DateTime<Utc>> = requested
            .iter()
            .filter_map(|id| self.active.get(id).map(|run| (*id, run.abort(grace))))
            .collect();

        let canceled = self
            .store
            .canceling_jobs(&requested, &mut |record: &mut JobRecord| {
                let Some(finished) = record.id.and_then(|id| stopped.get(&id)) else {
                    return false;
                };
                record.mark_canceled(*finished).is_ok()
            })?;

        for record in &canceled {
            if let Some(id) = record.id {
                self.active.remove(&id);
            }
            debug!(job_id = ?record.id, "job canceled");
            let observer = &self.observer;
            notify("on_cancel_job", || observer.on_cancel_job(record));
        }
        Ok(())
    }

    fn finish_phase(&mut self) -> Result<(), RunnerError> {
        if self.active.is_empty() {
            return Ok(());
        }

        let ids = self.active_ids();
        let active = &self.active;
        let now = Utc::now();

        let finished = self
            .store
            .running_jobs(&ids, &mut |record: &mut JobRecord| {
                let Some(run) = record.id.and_then(|id| active.get(&id)) else {
                    return false;
                };
                // Aborted runs are finalized by the cancel and timeout phases.
                if run.is_running() || run.is_aborted() {
                    return false;
                }
                let at = run.finished().unwrap_or(now);
                let outcome = match run.execution_error() {
                    None => record.mark_succeeded(at),
                    Some(message) => record.mark_failed(at, message),
                };
                outcome.is_ok()
            })?;

        for record in &finished {
            if let Some(id) = record.id {
                self.active.remove(&id);
            }
            debug!(job_id = ?record.id, status = %record.status, "job finished");
            let observer = &self.observer;
            notify("on_finish_job", || observer.on_finish_job(record));
            if record.status == JobStatus::Failed {
                self.retry(record);
            }
        }

        self.drop_orphaned_runs()
    }

    /// Forget completed runs whose record vanished or was finalized elsewhere.
    fn drop_orphaned_runs(&mut self) -> Result<(), RunnerError> {
        let completed: Vec<JobId> = self
            .active
            .iter()
            .filter(|(_, run)| !run.is_running())
            .map(|(id, _)| *id)
            .collect();

        for id in completed {
            let orphaned = match self.store.get_job(id)? {
                None => true,
                Some(record) => record.is_terminal(),
            };
            if orphaned {
                warn!(job_id = %id, "dropping finished run without a live record");
                self.active.remove(&id);
            }
        }
        Ok(())
    }

    fn timeout_phase(&mut self) -> Result<(), RunnerError> {
        if self.active.is_empty() {
            return Ok(());
        }

        let now = Utc::now();
        let grace = self.config.abort_grace();
        for run in self.active.values() {
            if run.has_exceeded_timeout(now) {
                run.abort(grace);
            }
        }
        // Also picks up runs aborted by an earlier heartbeat whose write was lost.
        if !self.active.values().any(JobRun::is_aborted) {
            return Ok(());
        }

        let ids = self.active_ids();
        let active = &self.active;
        let timed_out = self
            .store
            .running_jobs(&ids, &mut |record: &mut JobRecord| {
                let Some(run) = record.id.and_then(|id| active.get(&id)) else {
                    return false;
                };
                if !run.is_aborted() {
                    return false;
                }
                let Some(finished) = run.finished() else {
                    return false;
                };
                let timeout = run.job().timeout();
                record
                    .mark_timed_out(
                        finished,
                        format!("job exceeded its timeout of {} ms", timeout.as_millis()),
                    )
                    .is_ok()
            })?;

        for record in &timed_out {
            if let Some(id) = record.id {
                self.active.remove(&id);
            }
            warn!(job_id = ?record.id, job_type = %record.job_type, "job timed out");
            let observer = &self.observer;
            notify("on_timeout_job", || observer.on_timeout_job(record));
            self.retry(record);
        }
        Ok(())
    }

    fn dequeue_phase(&mut self) -> Result<(), RunnerError> {
        let available = self
            .config
            .maximum_concurrency
            .saturating_sub(self.active.len());
        if available == 0 {
            return Ok(());
        }

        let now = Utc::now();
        let claimed = self
            .store
            .dequeue_jobs(available, now, &mut |record: &mut JobRecord| {
                record.mark_started(now).is_ok()
            })?;

        let mut bad = Vec::new();
        for record in claimed {
            let Some(id) = record.id else {
                warn!(job_type = %record.job_type, "claimed record has no id");
                bad.push(record);
                continue;
            };
            match self.registry.resolve(&record) {
                Ok(job) => {
                    let run = JobRun::new(id, record.retry_count, Arc::from(job));
                    run.run();
                    self.active.insert(id, run);
                    debug!(job_id = %id, job_type = %record.job_type, "job dequeued");
                    let observer = &self.observer;
                    notify("on_dequeue_job", || observer.on_dequeue_job(&record));
                }
                Err(e) => {
                    warn!(job_id = %id, job_type = %record.job_type, error = %e, "cannot construct claimed job");
                    bad.push(record);
                }
            }
        }

        if !bad.is_empty() {
            self.handle_bad_records(&bad);
        }
        Ok(())
    }

    fn handle_bad_records(&self, bad: &[JobRecord]) {
        if self.config.delete_bad_scheduled_job_records {
            let ids: Vec<JobId> = bad.iter().filter_map(|r| r.id).collect();
            match self.store.delete_jobs(&ids) {
                Ok(deleted) => info!(deleted, "deleted unconstructible job records"),
                Err(e) => {
                    error!(error = %e, "failed to delete unconstructible job records");
                    self.report_error(None, Some(&e.into()));
                }
            }
        }

        if self.config.notify_on_bad_scheduled_jobs {
            for record in bad {
                self.report_error(Some(record), None);
            }
        }
    }

    fn schedule_phase(&mut self) -> Result<(), RunnerError> {
        let now = Utc::now();

        for schedule in &self.config.schedules {
            let next = schedule.next_execute_date(now);
            if let Some(latest) = self.store.latest_scheduled_job(&schedule.name)? {
                if latest.queue_date >= next {
                    continue;
                }
            }

            let job = match self.registry.create_for_schedule(schedule) {
                Ok(job) => job,
                Err(e) => {
                    error!(schedule = %schedule.name, error = %e, "cannot construct scheduled job");
                    self.report_error(None, Some(&e.into()));
                    continue;
                }
            };
            let record = match JobRecord::from_job(job.as_ref(), next) {
                Ok(record) => record.with_schedule(schedule.name.as_str()),
                Err(e) => {
                    let e = JobStoreError::Serialization(e.to_string());
                    error!(schedule = %schedule.name, error = %e, "cannot serialize scheduled job");
                    self.report_error(None, Some(&e.into()));
                    continue;
                }
            };

            let record = self.store.create_job(record)?;
            debug!(job_id = ?record.id, schedule = %schedule.name, queue_date = %next, "scheduled job enqueued");
            let observer = &self.observer;
            notify("on_enqueue_scheduled_job", || {
                observer.on_enqueue_scheduled_job(&record)
            });
        }
        Ok(())
    }

    /// Re-queue a failed or timed-out record while retries remain.
    fn retry(&self, record: &JobRecord) {
        if record.retry_count >= self.config.maximum_failed_retries {
            return;
        }

        match self.store.create_job(record.retry_of(Utc::now())) {
            Ok(retry) => info!(
                job_id = ?retry.id,
                previous = ?record.id,
                retry_count = retry.retry_count,
                "job re-queued"
            ),
            Err(e) => {
                error!(job_id = ?record.id, error = %e, "failed to re-queue job");
                self.report_error(Some(record), Some(&e.into()));
            }
        }
    }

    fn report_error(&self, record: Option<&JobRecord>, error: Option<&RunnerError>) {
        let observer = &self.observer;
        notify("on_error", || observer.on_error(record, error));
    }

    /// Stop tracking every active run, asking each to stop.
    ///
    /// Their records stay `Started`; nothing finalizes them.
    fn abandon_active_runs(&mut self) {
        let grace = self.config.abort_grace();
        for (id, run) in self.active.drain() {
            if run.is_running() {
                run.abort(grace);
                warn!(job_id = %id, "abandoned running job at shutdown");
            }
        }
    }
}

impl<S: JobStore + 'static> JobRunner<S> {
    /// Move the runner onto its own coordinator thread.
    pub fn spawn(mut self) -> std::io::Result<JobRunnerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let running = self.running.clone();

        let join = thread::Builder::new()
            .name("job-runner".to_string())
            .spawn(move || {
                info!(
                    heartbeat_ms = self.config.heartbeat_ms,
                    maximum_concurrency = self.config.maximum_concurrency,
                    schedules = self.config.schedules.len(),
                    "job runner started"
                );
                let heartbeat = self.config.heartbeat();
                loop {
                    self.heartbeat();
                    match shutdown_rx.recv_timeout(heartbeat) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                self.abandon_active_runs();
                info!("job runner stopped");
            })?;

        Ok(JobRunnerHandle {
            running,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Handle to control a spawned runner.
#[derive(Debug)]
pub struct JobRunnerHandle {
    running: Arc<AtomicBool>,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl JobRunnerHandle {
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signal the coordinator thread and wait for it to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::in_memory::InMemoryJobStore;
    use chrono::TimeZone;
    use jobforge_core::{Job, JobContext, JobError, RepeatType, ScheduleDefinition};
    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    #[derive(Serialize, Deserialize)]
    struct Noop {}

    impl Job for Noop {
        fn job_type(&self) -> &str {
            "noop"
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }

        fn serialize_data(&self) -> Result<JsonValue, JobError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register_serde::<Noop>("noop");
        Arc::new(registry)
    }

    fn schedule(name: &str, job_type: &str) -> ScheduleDefinition {
        ScheduleDefinition::new(
            name,
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            RepeatType::Daily,
            job_type,
        )
    }

    #[test]
    fn rejects_schedules_with_unregistered_job_types() {
        let config = RunnerConfig::default().with_schedule(schedule("nightly", "missing"));
        let err = JobRunner::new(InMemoryJobStore::new(), registry(), config)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RunnerError::UnknownScheduleJobType { ref schedule, ref job_type }
                if schedule == "nightly" && job_type == "missing"
        ));
    }

    #[test]
    fn rejects_duplicate_schedule_names() {
        let config = RunnerConfig::default()
            .with_schedule(schedule("nightly", "noop"))
            .with_schedule(schedule("nightly", "noop"));
        let err = JobRunner::new(InMemoryJobStore::new(), registry(), config)
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::DuplicateSchedule(ref name) if name == "nightly"));
    }

    #[test]
    fn rejects_invalid_config() {
        let config = RunnerConfig::default().with_maximum_concurrency(0);
        let err = JobRunner::new(InMemoryJobStore::new(), registry(), config)
            .err()
            .unwrap();
        assert!(matches!(err, RunnerError::Config(ConfigError::Invalid(_))));
    }

    #[test]
    fn start_and_stop_toggle_the_flag() {
        let runner =
            JobRunner::new(InMemoryJobStore::new(), registry(), RunnerConfig::default()).unwrap();
        assert!(!runner.is_running());
        runner.start();
        assert!(runner.is_running());
        runner.stop();
        assert!(!runner.is_running());
    }

    #[test]
    fn stopped_heartbeat_does_nothing() {
        let store = InMemoryJobStore::arc();
        store.enqueue(&Noop {}).unwrap();
        let config = RunnerConfig::default().with_schedule(schedule("nightly", "noop"));
        let mut runner = JobRunner::new(store.clone(), registry(), config).unwrap();

        runner.heartbeat();

        assert_eq!(runner.active_count(), 0);
        let stats = store.stats().unwrap();
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.total(), 1);
    }
}
