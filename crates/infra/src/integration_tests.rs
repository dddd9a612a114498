//! Integration tests for the job engine.
//!
//! Tests: JobStore → JobRunner (heartbeat phases) → JobRun → observer
//!
//! Verifies:
//! - Dequeue is fair and capacity-limited
//! - Cancellation, timeouts and retries end in the right terminal state
//! - Schedules materialize one record per occurrence
//! - Bad records, failing stores and panicking observers don't stop the runner

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use serde_json::Value as JsonValue;

    use jobforge_core::{
        Job, JobContext, JobError, JobId, JobRecord, JobRegistry, JobStatus, RepeatType,
        ScheduleDefinition,
    };

    use crate::config::RunnerConfig;
    use crate::jobs::{
        InMemoryJobStore, JobRunner, JobRunnerObserver, JobStats, JobStore, JobStoreError,
        Reconcile, RunnerError,
    };

    // --- jobs -------------------------------------------------------------

    #[derive(Serialize, Deserialize)]
    struct Sleep {
        millis: u64,
    }

    impl Job for Sleep {
        fn job_type(&self) -> &str {
            "sleep"
        }

        fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
            ctx.sleep(Duration::from_millis(self.millis))
        }

        fn serialize_data(&self) -> Result<JsonValue, JobError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Fail {}

    impl Job for Fail {
        fn job_type(&self) -> &str {
            "fail"
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Err(JobError::failed("boom"))
        }

        fn serialize_data(&self) -> Result<JsonValue, JobError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    /// Runs far longer than its own timeout.
    #[derive(Serialize, Deserialize)]
    struct Slow {
        timeout_ms: u64,
    }

    impl Job for Slow {
        fn job_type(&self) -> &str {
            "slow"
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(self.timeout_ms)
        }

        fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
            ctx.sleep(Duration::from_secs(30))
        }

        fn serialize_data(&self) -> Result<JsonValue, JobError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    /// Ignores its cancellation token.
    #[derive(Serialize, Deserialize)]
    struct Stubborn {
        millis: u64,
        timeout_ms: u64,
    }

    impl Job for Stubborn {
        fn job_type(&self) -> &str {
            "stubborn"
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(self.timeout_ms)
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            thread::sleep(Duration::from_millis(self.millis));
            Ok(())
        }

        fn serialize_data(&self) -> Result<JsonValue, JobError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Echo {
        message: String,
    }

    impl Job for Echo {
        fn job_type(&self) -> &str {
            "echo"
        }

        fn name(&self) -> String {
            format!("echo: {}", self.message)
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            Ok(())
        }

        fn serialize_data(&self) -> Result<JsonValue, JobError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Explode {}

    impl Job for Explode {
        fn job_type(&self) -> &str {
            "explode"
        }

        fn execute(&self, _ctx: &JobContext) -> Result<(), JobError> {
            panic!("detonated");
        }

        fn serialize_data(&self) -> Result<JsonValue, JobError> {
            Ok(serde_json::to_value(self)?)
        }
    }

    fn registry() -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register_serde::<Sleep>("sleep");
        registry.register_serde::<Fail>("fail");
        registry.register_serde::<Slow>("slow");
        registry.register_serde::<Stubborn>("stubborn");
        registry.register_serde::<Echo>("echo");
        registry.register_serde::<Explode>("explode");
        Arc::new(registry)
    }

    // --- observer ---------------------------------------------------------

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Dequeue(JobId),
        Cancel(JobId),
        Finish(JobId, JobStatus),
        Timeout(JobId),
        Scheduled(JobId),
        Error {
            record: Option<JobId>,
            error: Option<String>,
        },
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<Event>>,
        panic_on_dequeue: bool,
    }

    impl RecordingObserver {
        fn push(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        fn count(&self, matches: impl Fn(&Event) -> bool) -> usize {
            self.events().iter().filter(|e| matches(e)).count()
        }
    }

    impl JobRunnerObserver for RecordingObserver {
        fn on_dequeue_job(&self, record: &JobRecord) {
            self.push(Event::Dequeue(record.id.unwrap()));
            if self.panic_on_dequeue {
                panic!("observer bug");
            }
        }

        fn on_cancel_job(&self, record: &JobRecord) {
            self.push(Event::Cancel(record.id.unwrap()));
        }

        fn on_finish_job(&self, record: &JobRecord) {
            self.push(Event::Finish(record.id.unwrap(), record.status));
        }

        fn on_timeout_job(&self, record: &JobRecord) {
            self.push(Event::Timeout(record.id.unwrap()));
        }

        fn on_enqueue_scheduled_job(&self, record: &JobRecord) {
            self.push(Event::Scheduled(record.id.unwrap()));
        }

        fn on_error(&self, record: Option<&JobRecord>, error: Option<&RunnerError>) {
            self.push(Event::Error {
                record: record.and_then(|r| r.id),
                error: error.map(ToString::to_string),
            });
        }
    }

    // --- harness ----------------------------------------------------------

    fn config() -> RunnerConfig {
        RunnerConfig::default()
            .with_heartbeat(Duration::from_millis(10))
            .with_abort_grace(Duration::from_secs(1))
    }

    fn setup_with(
        config: RunnerConfig,
        observer: RecordingObserver,
    ) -> (
        Arc<InMemoryJobStore>,
        Arc<RecordingObserver>,
        JobRunner<Arc<InMemoryJobStore>>,
    ) {
        let store = InMemoryJobStore::arc();
        let observer = Arc::new(observer);
        let runner = JobRunner::new(store.clone(), registry(), config)
            .unwrap()
            .with_observer(observer.clone());
        runner.start();
        (store, observer, runner)
    }

    fn setup(
        config: RunnerConfig,
    ) -> (
        Arc<InMemoryJobStore>,
        Arc<RecordingObserver>,
        JobRunner<Arc<InMemoryJobStore>>,
    ) {
        setup_with(config, RecordingObserver::default())
    }

    /// Heartbeat until `done` holds, failing after five seconds.
    fn pump_until<S: JobStore>(runner: &mut JobRunner<S>, done: impl Fn(&JobRunner<S>) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            runner.heartbeat();
            if done(runner) {
                return;
            }
            assert!(Instant::now() < deadline, "runner did not reach the expected state");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn status_of<S: JobStore>(store: &S, id: JobId) -> Option<JobStatus> {
        store.get_job(id).unwrap().map(|r| r.status)
    }

    fn queued_at(job: &dyn Job, at: DateTime<Utc>) -> JobRecord {
        JobRecord::from_job(job, at).unwrap()
    }

    // --- scenarios --------------------------------------------------------

    #[test]
    fn dequeue_claims_the_oldest_records_up_to_capacity() {
        let (store, observer, mut runner) = setup(config().with_maximum_concurrency(2));
        let now = Utc::now();
        let ids: Vec<JobId> = (0..5)
            .map(|i| {
                let at = now - chrono::Duration::seconds(10 - i);
                store
                    .create_job(queued_at(&Sleep { millis: 300 }, at))
                    .unwrap()
                    .id
                    .unwrap()
            })
            .collect();

        runner.heartbeat();

        assert_eq!(runner.active_count(), 2);
        assert!(runner.is_active(ids[0]));
        assert!(runner.is_active(ids[1]));
        assert_eq!(status_of(&store, ids[0]), Some(JobStatus::Started));
        assert_eq!(status_of(&store, ids[1]), Some(JobStatus::Started));
        for id in &ids[2..] {
            assert_eq!(status_of(&store, *id), Some(JobStatus::Queued));
        }
        assert_eq!(observer.count(|e| matches!(e, Event::Dequeue(_))), 2);

        // No free capacity while both runs are busy.
        runner.heartbeat();
        assert_eq!(runner.active_count(), 2);
        assert_eq!(store.stats().unwrap().queued, 3);
    }

    #[test]
    fn successful_job_is_finalized_once() {
        let (store, observer, mut runner) = setup(config());
        let id = store.enqueue(&Sleep { millis: 0 }).unwrap().id.unwrap();

        pump_until(&mut runner, |r| {
            status_of(r.store(), id) == Some(JobStatus::Succeeded)
        });
        for _ in 0..3 {
            runner.heartbeat();
        }

        let record = store.get_job(id).unwrap().unwrap();
        assert!(record.start_date.is_some());
        assert!(record.finish_date >= record.start_date);
        assert_eq!(record.exception, None);
        assert!(!runner.is_active(id));
        assert_eq!(
            observer.events(),
            vec![Event::Dequeue(id), Event::Finish(id, JobStatus::Succeeded)]
        );

        // A terminal record rejects any further reconcile.
        let rewritten = store
            .update_jobs(
                vec![record],
                Some(&mut |r: &mut JobRecord| r.mark_failed(Utc::now(), "late").is_ok()),
            )
            .unwrap();
        assert!(rewritten.is_empty());
        assert_eq!(status_of(&store, id), Some(JobStatus::Succeeded));
    }

    #[test]
    fn canceling_a_running_job() {
        let (store, observer, mut runner) = setup(config());
        let id = store.enqueue(&Sleep { millis: 30_000 }).unwrap().id.unwrap();

        runner.heartbeat();
        assert!(runner.is_active(id));

        store.request_cancel(id).unwrap();
        let started = Instant::now();
        runner.heartbeat();
        assert!(started.elapsed() < Duration::from_secs(1));

        let record = store.get_job(id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Canceled);
        assert!(record.finish_date.is_some());
        assert!(!runner.is_active(id));
        assert_eq!(observer.count(|e| *e == Event::Cancel(id)), 1);
    }

    #[test]
    fn overrunning_job_times_out() {
        let (store, observer, mut runner) = setup(config());
        let id = store.enqueue(&Slow { timeout_ms: 20 }).unwrap().id.unwrap();

        runner.heartbeat();
        assert!(runner.is_active(id));
        thread::sleep(Duration::from_millis(60));
        runner.heartbeat();

        let record = store.get_job(id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::TimedOut);
        assert!(record.exception.unwrap().contains("timeout"));
        assert!(record.finish_date.is_some());
        assert!(!runner.is_active(id));
        assert_eq!(observer.count(|e| *e == Event::Timeout(id)), 1);

        // No retries configured.
        assert_eq!(store.stats().unwrap().total(), 1);
    }

    #[test]
    fn host_calls_are_not_held_up_by_a_cancel_abort() {
        let grace = Duration::from_millis(800);
        let (store, _observer, mut runner) = setup(config().with_abort_grace(grace));
        let id = store
            .enqueue(&Stubborn { millis: 3_000, timeout_ms: 60_000 })
            .unwrap()
            .id
            .unwrap();

        runner.heartbeat();
        store.request_cancel(id).unwrap();

        let blocked = thread::scope(|s| {
            let heartbeat = s.spawn(|| runner.heartbeat());
            thread::sleep(Duration::from_millis(100));
            let started = Instant::now();
            store.enqueue(&Echo { message: "meanwhile".into() }).unwrap();
            let blocked = started.elapsed();
            heartbeat.join().unwrap();
            blocked
        });

        assert!(blocked < Duration::from_millis(200), "enqueue blocked for {blocked:?}");
        assert_eq!(status_of(&store, id), Some(JobStatus::Canceled));
        assert!(!runner.is_active(id));
    }

    #[test]
    fn host_calls_are_not_held_up_by_a_timeout_abort() {
        let grace = Duration::from_millis(800);
        let (store, observer, mut runner) = setup(config().with_abort_grace(grace));
        let id = store
            .enqueue(&Stubborn { millis: 3_000, timeout_ms: 20 })
            .unwrap()
            .id
            .unwrap();

        runner.heartbeat();
        thread::sleep(Duration::from_millis(60));

        let blocked = thread::scope(|s| {
            let heartbeat = s.spawn(|| runner.heartbeat());
            thread::sleep(Duration::from_millis(100));
            let started = Instant::now();
            store.get_job(id).unwrap();
            let blocked = started.elapsed();
            heartbeat.join().unwrap();
            blocked
        });

        assert!(blocked < Duration::from_millis(200), "get_job blocked for {blocked:?}");
        let record = store.get_job(id).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::TimedOut);
        assert!(record.finish_date.is_some());
        assert_eq!(observer.count(|e| *e == Event::Timeout(id)), 1);
    }

    #[test]
    fn finished_run_frees_capacity_within_the_same_heartbeat() {
        let (store, observer, mut runner) = setup(config().with_maximum_concurrency(1));
        let now = Utc::now();
        let done = store
            .create_job(queued_at(&Sleep { millis: 0 }, now - chrono::Duration::seconds(2)))
            .unwrap()
            .id
            .unwrap();
        let waiting = store
            .create_job(queued_at(&Sleep { millis: 5_000 }, now - chrono::Duration::seconds(1)))
            .unwrap()
            .id
            .unwrap();

        runner.heartbeat();
        assert!(runner.is_active(done));
        assert_eq!(status_of(&store, waiting), Some(JobStatus::Queued));
        thread::sleep(Duration::from_millis(100));

        runner.heartbeat();

        assert_eq!(status_of(&store, done), Some(JobStatus::Succeeded));
        assert_eq!(status_of(&store, waiting), Some(JobStatus::Started));
        assert!(runner.is_active(waiting));
        assert_eq!(runner.active_count(), 1);
        assert_eq!(
            observer.events(),
            vec![
                Event::Dequeue(done),
                Event::Finish(done, JobStatus::Succeeded),
                Event::Dequeue(waiting),
            ]
        );
    }

    #[test]
    fn timed_out_run_frees_capacity_within_the_same_heartbeat() {
        let (store, observer, mut runner) = setup(config().with_maximum_concurrency(1));
        let now = Utc::now();
        let slow = store
            .create_job(queued_at(&Slow { timeout_ms: 20 }, now - chrono::Duration::seconds(2)))
            .unwrap()
            .id
            .unwrap();
        let waiting = store
            .create_job(queued_at(&Sleep { millis: 5_000 }, now - chrono::Duration::seconds(1)))
            .unwrap()
            .id
            .unwrap();

        runner.heartbeat();
        assert!(runner.is_active(slow));
        thread::sleep(Duration::from_millis(60));

        runner.heartbeat();

        assert_eq!(status_of(&store, slow), Some(JobStatus::TimedOut));
        assert_eq!(status_of(&store, waiting), Some(JobStatus::Started));
        assert!(runner.is_active(waiting));
        assert_eq!(runner.active_count(), 1);
        assert_eq!(
            observer.events(),
            vec![
                Event::Dequeue(slow),
                Event::Timeout(slow),
                Event::Dequeue(waiting),
            ]
        );
    }

    #[test]
    fn failed_job_is_retried_up_to_the_limit() {
        let (store, observer, mut runner) = setup(config().with_maximum_failed_retries(2));
        store.enqueue(&Fail {}).unwrap();

        pump_until(&mut runner, |r| r.store().stats().unwrap().failed == 3);
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(5));
            runner.heartbeat();
        }

        let records = store.list_jobs(None, 10).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.status == JobStatus::Failed));
        assert!(records.iter().all(|r| r.exception.as_deref() == Some("boom")));

        let mut retry_counts: Vec<u32> = records.iter().map(|r| r.retry_count).collect();
        retry_counts.sort_unstable();
        assert_eq!(retry_counts, vec![0, 1, 2]);
        assert_eq!(
            observer.count(|e| matches!(e, Event::Finish(_, JobStatus::Failed))),
            3
        );
    }

    #[test]
    fn timed_out_job_is_retried() {
        let (store, _observer, mut runner) = setup(config().with_maximum_failed_retries(1));
        let id = store.enqueue(&Slow { timeout_ms: 10 }).unwrap().id.unwrap();

        pump_until(&mut runner, |r| r.store().stats().unwrap().timed_out == 2);

        let retry = store
            .list_jobs(Some(JobStatus::TimedOut), 10)
            .unwrap()
            .into_iter()
            .find(|r| r.id != Some(id))
            .unwrap();
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.job_type, "slow");
    }

    #[test]
    fn panicking_job_fails() {
        let (store, _observer, mut runner) = setup(config());
        let id = store.enqueue(&Explode {}).unwrap().id.unwrap();

        pump_until(&mut runner, |r| {
            status_of(r.store(), id) == Some(JobStatus::Failed)
        });

        let record = store.get_job(id).unwrap().unwrap();
        assert_eq!(record.exception.as_deref(), Some("job panicked: detonated"));
    }

    #[test]
    fn schedule_materializes_one_record_per_occurrence() {
        let start_on = Utc::now() + chrono::Duration::milliseconds(100);
        let schedule = ScheduleDefinition::new("tick", start_on, RepeatType::Hourly, "echo")
            .with_metadata("message", "hello");
        let (store, observer, mut runner) = setup(config().with_schedule(schedule));

        for _ in 0..3 {
            runner.heartbeat();
        }
        let records = store.list_jobs(None, 10).unwrap();
        assert_eq!(records.len(), 1);
        let first = &records[0];
        assert_eq!(first.status, JobStatus::Queued);
        assert_eq!(first.queue_date, start_on);
        assert_eq!(first.schedule_name.as_deref(), Some("tick"));
        assert_eq!(first.name, "echo: hello");
        let first_id = first.id.unwrap();

        thread::sleep(Duration::from_millis(150));
        pump_until(&mut runner, |r| {
            status_of(r.store(), first_id) == Some(JobStatus::Succeeded)
        });
        for _ in 0..3 {
            runner.heartbeat();
        }

        let records = store.list_jobs(None, 10).unwrap();
        assert_eq!(records.len(), 2);
        let next = records.iter().find(|r| r.id != Some(first_id)).unwrap();
        assert_eq!(next.status, JobStatus::Queued);
        assert_eq!(next.queue_date, start_on + chrono::Duration::hours(1));
        assert_eq!(observer.count(|e| matches!(e, Event::Scheduled(_))), 2);
    }

    #[test]
    fn bad_records_are_deleted_and_reported() {
        let mut config = config();
        config.delete_bad_scheduled_job_records = true;
        config.notify_on_bad_scheduled_jobs = true;
        let (store, observer, mut runner) = setup(config);

        let id = store
            .create_job(JobRecord::new("ghost", "ghost", serde_json::json!({}), Utc::now()))
            .unwrap()
            .id
            .unwrap();

        runner.heartbeat();

        assert_eq!(store.get_job(id).unwrap(), None);
        assert_eq!(runner.active_count(), 0);
        assert_eq!(
            observer.events(),
            vec![Event::Error {
                record: Some(id),
                error: None
            }]
        );
    }

    #[test]
    fn bad_records_stay_claimed_when_not_deleted() {
        let mut config = config();
        config.delete_bad_scheduled_job_records = false;
        config.notify_on_bad_scheduled_jobs = false;
        let (store, observer, mut runner) = setup(config);

        let unknown = store
            .create_job(JobRecord::new("ghost", "ghost", serde_json::json!({}), Utc::now()))
            .unwrap()
            .id
            .unwrap();
        let undecodable = store
            .create_job(JobRecord::new(
                "sleep",
                "sleep",
                serde_json::json!({ "millis": "soon" }),
                Utc::now(),
            ))
            .unwrap()
            .id
            .unwrap();

        runner.heartbeat();
        runner.heartbeat();

        assert_eq!(status_of(&store, unknown), Some(JobStatus::Started));
        assert_eq!(status_of(&store, undecodable), Some(JobStatus::Started));
        assert_eq!(runner.active_count(), 0);
        assert!(observer.events().is_empty());
    }

    #[test]
    fn panicking_observer_does_not_break_the_heartbeat() {
        let observer = RecordingObserver {
            panic_on_dequeue: true,
            ..Default::default()
        };
        let (store, observer, mut runner) = setup_with(config(), observer);
        let id = store.enqueue(&Sleep { millis: 0 }).unwrap().id.unwrap();

        pump_until(&mut runner, |r| {
            status_of(r.store(), id) == Some(JobStatus::Succeeded)
        });
        assert_eq!(observer.count(|e| *e == Event::Finish(id, JobStatus::Succeeded)), 1);
    }

    #[test]
    fn stopped_runner_leaves_runs_alone() {
        let (store, observer, mut runner) = setup(config());
        let id = store.enqueue(&Sleep { millis: 30_000 }).unwrap().id.unwrap();
        runner.heartbeat();
        assert!(runner.is_active(id));

        runner.stop();
        store.request_cancel(id).unwrap();
        store.enqueue(&Sleep { millis: 0 }).unwrap();
        runner.heartbeat();

        assert!(runner.is_active(id));
        assert_eq!(runner.active_count(), 1);
        assert_eq!(status_of(&store, id), Some(JobStatus::Canceling));
        assert_eq!(store.stats().unwrap().queued, 1);

        runner.start();
        runner.heartbeat();
        assert_eq!(status_of(&store, id), Some(JobStatus::Canceled));
        assert_eq!(observer.count(|e| *e == Event::Cancel(id)), 1);
    }

    #[test]
    fn store_failures_skip_the_phase_and_recover() {
        let store = Arc::new(FlakyStore::default());
        store.fail_dequeue.store(true, Ordering::SeqCst);
        let observer = Arc::new(RecordingObserver::default());
        let mut runner = JobRunner::new(store.clone(), registry(), config())
            .unwrap()
            .with_observer(observer.clone());
        runner.start();

        let id = store.enqueue(&Sleep { millis: 0 }).unwrap().id.unwrap();
        runner.heartbeat();

        assert_eq!(status_of(&store, id), Some(JobStatus::Queued));
        assert_eq!(
            observer.count(|e| matches!(e, Event::Error { record: None, error: Some(msg) } if msg.contains("disk on fire"))),
            1
        );

        pump_until(&mut runner, |r| {
            status_of(r.store(), id) == Some(JobStatus::Succeeded)
        });
    }

    #[test]
    fn claimed_record_without_id_is_reported_as_bad() {
        let store = Arc::new(FlakyStore::default());
        store.strip_claimed_ids.store(true, Ordering::SeqCst);
        let observer = Arc::new(RecordingObserver::default());
        let mut runner = JobRunner::new(store.clone(), registry(), config())
            .unwrap()
            .with_observer(observer.clone());
        runner.start();

        store.enqueue(&Echo { message: "lost".into() }).unwrap();
        runner.heartbeat();

        assert_eq!(runner.active_count(), 0);
        assert_eq!(
            observer.events(),
            vec![Event::Error {
                record: None,
                error: None
            }]
        );
    }

    #[test]
    fn spawned_runner_is_controlled_through_its_handle() {
        let store = InMemoryJobStore::arc();
        let runner = JobRunner::new(store.clone(), registry(), config()).unwrap();
        let handle = runner.spawn().unwrap();
        assert!(!handle.is_running());

        let id = store.enqueue(&Sleep { millis: 0 }).unwrap().id.unwrap();
        handle.start();
        assert!(handle.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while status_of(&store, id) != Some(JobStatus::Succeeded) {
            assert!(Instant::now() < deadline, "spawned runner never finished the job");
            thread::sleep(Duration::from_millis(10));
        }

        handle.stop();
        assert!(!handle.is_running());
        handle.shutdown();
    }

    // --- flaky store ------------------------------------------------------

    /// In-memory store whose next dequeue fails when `fail_dequeue` is set,
    /// and whose claims lose their ids when `strip_claimed_ids` is set.
    #[derive(Default)]
    struct FlakyStore {
        inner: InMemoryJobStore,
        fail_dequeue: AtomicBool,
        strip_claimed_ids: AtomicBool,
    }

    impl JobStore for FlakyStore {
        fn create_job(&self, record: JobRecord) -> Result<JobRecord, JobStoreError> {
            self.inner.create_job(record)
        }

        fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
            self.inner.get_job(job_id)
        }

        fn dequeue_jobs(
            &self,
            max: usize,
            now: DateTime<Utc>,
            claim: Reconcile<'_>,
        ) -> Result<Vec<JobRecord>, JobStoreError> {
            if self.fail_dequeue.swap(false, Ordering::SeqCst) {
                return Err(JobStoreError::Storage("disk on fire".into()));
            }
            let mut claimed = self.inner.dequeue_jobs(max, now, claim)?;
            if self.strip_claimed_ids.load(Ordering::SeqCst) {
                claimed.iter_mut().for_each(|r| r.id = None);
            }
            Ok(claimed)
        }

        fn canceling_jobs(
            &self,
            active: &[JobId],
            reconcile: Reconcile<'_>,
        ) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.canceling_jobs(active, reconcile)
        }

        fn running_jobs(
            &self,
            active: &[JobId],
            reconcile: Reconcile<'_>,
        ) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.running_jobs(active, reconcile)
        }

        fn update_jobs(
            &self,
            records: Vec<JobRecord>,
            mutate: Option<Reconcile<'_>>,
        ) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.update_jobs(records, mutate)
        }

        fn delete_jobs(&self, job_ids: &[JobId]) -> Result<usize, JobStoreError> {
            self.inner.delete_jobs(job_ids)
        }

        fn latest_scheduled_job(
            &self,
            schedule_name: &str,
        ) -> Result<Option<JobRecord>, JobStoreError> {
            self.inner.latest_scheduled_job(schedule_name)
        }

        fn list_jobs(
            &self,
            status: Option<JobStatus>,
            limit: usize,
        ) -> Result<Vec<JobRecord>, JobStoreError> {
            self.inner.list_jobs(status, limit)
        }

        fn stats(&self) -> Result<JobStats, JobStoreError> {
            self.inner.stats()
        }
    }
}
