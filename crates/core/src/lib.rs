//! `jobforge-core`: job model building blocks.
//!
//! This crate contains the **pure** parts of the engine: identifiers, the
//! job record and its status machine, the job contract, the type registry
//! and schedule computation. No storage or threading concerns live here.

pub mod error;
pub mod id;
pub mod job;
pub mod record;
pub mod registry;
pub mod schedule;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{DEFAULT_JOB_TIMEOUT, Job, JobContext, JobError, JobMetadata};
pub use record::JobRecord;
pub use registry::{JobConstructor, JobRegistry, JobSeed};
pub use schedule::{RepeatType, ScheduleDefinition, next_execute_date};
pub use status::JobStatus;
