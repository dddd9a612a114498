//! Durable background job engine.
//!
//! ## Components
//!
//! - `JobStore`: persistence boundary (in-memory or Postgres)
//! - `JobRun`: one attempt of a job, executing on its own worker thread
//! - `JobRunner`: heartbeat coordinator that claims, tracks, finalizes and
//!   retries jobs, and materializes schedules
//! - `JobRunnerObserver`: lifecycle callbacks for the host
//!
//! ## Status machine
//!
//! ```text
//! Queued -> Started -> Succeeded | Failed | TimedOut
//!              |
//!              v
//!          Canceling -> Canceled
//! ```

pub mod in_memory;
pub mod observer;
pub mod postgres;
pub mod run;
pub mod runner;
pub mod store;

pub use in_memory::InMemoryJobStore;
pub use observer::{JobRunnerObserver, NoopObserver, TracingObserver};
pub use postgres::PostgresJobStore;
pub use run::JobRun;
pub use runner::{JobRunner, JobRunnerHandle, RunnerError};
pub use store::{JobStats, JobStore, JobStoreError, Reconcile};
