//! Lifecycle callbacks raised by the job runner.

use std::panic::{self, AssertUnwindSafe};

use tracing::{error, info, warn};

use jobforge_core::JobRecord;

use super::runner::RunnerError;

/// Host hook into the runner's lifecycle.
///
/// Every method defaults to a no-op so observers only implement what they
/// care about. Callbacks run on the coordinator thread between phases; a
/// slow callback delays the heartbeat, a panicking one is logged and ignored.
pub trait JobRunnerObserver: Send + Sync {
    /// A queued record was claimed and its run started.
    fn on_dequeue_job(&self, _record: &JobRecord) {}

    /// A canceling record was aborted and persisted as canceled.
    fn on_cancel_job(&self, _record: &JobRecord) {}

    /// A run completed and its record was persisted as succeeded or failed.
    fn on_finish_job(&self, _record: &JobRecord) {}

    /// A run exceeded its timeout and was persisted as timed out.
    fn on_timeout_job(&self, _record: &JobRecord) {}

    /// A schedule occurrence was materialized as a queued record.
    fn on_enqueue_scheduled_job(&self, _record: &JobRecord) {}

    /// Something went wrong. `record` is set for bad records, `error` for
    /// store and construction failures.
    fn on_error(&self, _record: Option<&JobRecord>, _error: Option<&RunnerError>) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl JobRunnerObserver for NoopObserver {}

/// Observer that logs every callback through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl JobRunnerObserver for TracingObserver {
    fn on_dequeue_job(&self, record: &JobRecord) {
        info!(job_id = ?record.id, job_type = %record.job_type, retry_count = record.retry_count, "job dequeued");
    }

    fn on_cancel_job(&self, record: &JobRecord) {
        info!(job_id = ?record.id, job_type = %record.job_type, "job canceled");
    }

    fn on_finish_job(&self, record: &JobRecord) {
        match &record.exception {
            Some(exception) => warn!(
                job_id = ?record.id,
                job_type = %record.job_type,
                status = %record.status,
                error = %exception,
                "job failed"
            ),
            None => info!(job_id = ?record.id, job_type = %record.job_type, status = %record.status, "job finished"),
        }
    }

    fn on_timeout_job(&self, record: &JobRecord) {
        warn!(job_id = ?record.id, job_type = %record.job_type, "job timed out");
    }

    fn on_enqueue_scheduled_job(&self, record: &JobRecord) {
        info!(
            job_id = ?record.id,
            schedule = record.schedule_name.as_deref().unwrap_or_default(),
            queue_date = %record.queue_date,
            "scheduled job enqueued"
        );
    }

    fn on_error(&self, record: Option<&JobRecord>, error: Option<&RunnerError>) {
        error!(
            job_id = ?record.and_then(|r| r.id),
            job_type = record.map(|r| r.job_type.as_str()).unwrap_or_default(),
            error = %error.map(ToString::to_string).unwrap_or_default(),
            "job runner error"
        );
    }
}

/// Run an observer callback, containing any panic it raises.
pub(crate) fn notify(callback: &str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        error!(callback, panic = %message, "job runner observer panicked");
    }
}
