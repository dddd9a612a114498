//! The job contract implemented by host applications.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::id::JobId;

/// Timeout budget used when a job does not override [`Job::timeout`].
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Granularity of [`JobContext::sleep`] cancellation checks.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// String-keyed metadata handed to the constructor of schedule-materialized jobs.
pub type JobMetadata = BTreeMap<String, String>;

/// Error returned by job code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),
    #[error("job was cancelled")]
    Cancelled,
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl JobError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A unit of background work.
///
/// Jobs are executed on a dedicated worker thread. `execute` may block, but
/// long-running work should poll [`JobContext::is_cancelled`] (or use
/// [`JobContext::sleep`]) so that cancel requests and timeouts can stop it.
/// A job that ignores its context is detached by the runner after a grace
/// period and keeps running unobserved.
pub trait Job: Send + Sync + 'static {
    /// Registry key used to rebuild the job from a persisted record.
    fn job_type(&self) -> &str;

    /// Display name stored on the record.
    fn name(&self) -> String {
        self.job_type().to_string()
    }

    /// Maximum run time before the runner times the job out.
    fn timeout(&self) -> Duration {
        DEFAULT_JOB_TIMEOUT
    }

    /// Do the work.
    fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;

    /// Serialize internal state into the record's `data` column.
    fn serialize_data(&self) -> Result<JsonValue, JobError>;
}

/// Per-attempt execution context.
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    retry_count: u32,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, retry_count: u32, cancellation: CancellationToken) -> Self {
        Self {
            job_id,
            retry_count,
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Number of earlier failed attempts of this job (0 for the original record).
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Fail fast with [`JobError::Cancelled`] if an abort was requested.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early with [`JobError::Cancelled`] on abort.
    pub fn sleep(&self, duration: Duration) -> Result<(), JobError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}
