//! Isolated execution of a single job attempt.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jobforge_core::{Job, JobContext, JobId};

/// How often `abort` checks whether the worker has stopped.
const ABORT_POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RunPhase {
    NotStarted,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug)]
struct RunState {
    phase: RunPhase,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    execution_error: Option<String>,
}

/// One in-flight attempt of a job.
///
/// The job executes on its own worker thread. The runner polls `is_running`,
/// `finished` and `execution_error` at heartbeat boundaries; all state sits
/// behind a single mutex so those reads are consistent with each other.
///
/// `abort` never kills the worker: it fires the job's cancellation token,
/// waits up to a grace period, and otherwise detaches the thread.
pub struct JobRun {
    job_id: JobId,
    job: Arc<dyn Job>,
    context: JobContext,
    cancellation: CancellationToken,
    state: Arc<Mutex<RunState>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl JobRun {
    pub fn new(job_id: JobId, retry_count: u32, job: Arc<dyn Job>) -> Self {
        let cancellation = CancellationToken::new();
        Self {
            job_id,
            job,
            context: JobContext::new(job_id, retry_count, cancellation.clone()),
            cancellation,
            state: Arc::new(Mutex::new(RunState {
                phase: RunPhase::NotStarted,
                started: None,
                finished: None,
                execution_error: None,
            })),
            worker: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job(&self) -> &Arc<dyn Job> {
        &self.job
    }

    pub fn is_running(&self) -> bool {
        self.lock().phase == RunPhase::Running
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().phase == RunPhase::Aborted
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.lock().started
    }

    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.lock().finished
    }

    pub fn execution_error(&self) -> Option<String> {
        self.lock().execution_error.clone()
    }

    /// Whether the run has been executing for longer than the job's budget.
    pub fn has_exceeded_timeout(&self, now: DateTime<Utc>) -> bool {
        let state = self.lock();
        if state.phase != RunPhase::Running {
            return false;
        }
        let Some(started) = state.started else {
            return false;
        };
        let elapsed = (now - started).to_std().unwrap_or(Duration::ZERO);
        elapsed > self.job.timeout()
    }

    /// Start executing on a worker thread.
    ///
    /// Returns `false` when the run was already started; only the first call
    /// has any effect.
    pub fn run(&self) -> bool {
        {
            let mut state = self.lock();
            if state.phase != RunPhase::NotStarted {
                return false;
            }
            state.phase = RunPhase::Running;
            state.started = Some(Utc::now());
        }

        let job = self.job.clone();
        let context = self.context.clone();
        let state = self.state.clone();

        let spawned = thread::Builder::new()
            .name(format!("job-run-{}", self.job_id))
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.execute(&context)));
                let error = match outcome {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(payload) => Some(format!("job panicked: {}", panic_message(&*payload))),
                };
                complete(&state, error);
            });

        match spawned {
            Ok(handle) => {
                *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "failed to spawn job worker");
                complete(&self.state, Some(format!("failed to spawn worker thread: {e}")));
            }
        }
        true
    }

    /// Stop tracking the run, asking the job to stop first.
    ///
    /// The run is marked finished (not running) when this returns, whether or
    /// not the worker actually stopped within `grace`. Calling it again
    /// returns the first finish time. Returns the finish time.
    pub fn abort(&self, grace: Duration) -> DateTime<Utc> {
        {
            let state = self.lock();
            match state.phase {
                RunPhase::Running => {}
                RunPhase::NotStarted => {
                    drop(state);
                    return self.mark_aborted();
                }
                RunPhase::Completed | RunPhase::Aborted => {
                    return state.finished.unwrap_or_else(Utc::now);
                }
            }
        }

        self.cancellation.cancel();

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let deadline = Instant::now() + grace;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(ABORT_POLL_INTERVAL);
            }
            if handle.is_finished() {
                let _ = handle.join();
                debug!(job_id = %self.job_id, "job worker stopped after abort");
            } else {
                warn!(
                    job_id = %self.job_id,
                    grace_ms = grace.as_millis() as u64,
                    "job worker ignored cancellation; detaching"
                );
            }
        }

        self.mark_aborted()
    }

    fn mark_aborted(&self) -> DateTime<Utc> {
        let mut state = self.lock();
        if state.phase != RunPhase::Aborted {
            state.phase = RunPhase::Aborted;
            state.finished = Some(Utc::now());
        }
        state.finished.unwrap_or_else(Utc::now)
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for JobRun {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.lock();
        f.debug_struct("JobRun")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job.job_type())
            .field("phase", &state.phase)
            .field("started", &state.started)
            .field("finished", &state.finished)
            .finish()
    }
}

/// Record the worker's outcome unless the run was aborted meanwhile.
fn complete(state: &Mutex<RunState>, error: Option<String>) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.phase == RunPhase::Running {
        state.phase = RunPhase::Completed;
        state.finished = Some(Utc::now());
        state.execution_error = error;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
