//! Explicit job type registry.
//!
//! Records only carry a string `job_type`; the registry maps that key back to
//! a constructor. Unknown keys are a plain lookup miss.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::job::{Job, JobError, JobMetadata};
use crate::record::JobRecord;
use crate::schedule::ScheduleDefinition;

/// Input handed to a job constructor.
#[derive(Debug, Clone, Copy)]
pub enum JobSeed<'a> {
    /// Serialized state of a persisted record.
    Data(&'a JsonValue),
    /// Metadata of a schedule definition, for a fresh occurrence.
    Metadata(&'a JobMetadata),
}

/// Job constructor function type.
pub type JobConstructor =
    Box<dyn Fn(JobSeed<'_>) -> Result<Box<dyn Job>, JobError> + Send + Sync>;

/// Maps stable job type keys to constructors.
#[derive(Default)]
pub struct JobRegistry {
    constructors: HashMap<String, JobConstructor>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for a job type key, replacing any previous one.
    pub fn register<F>(&mut self, job_type: impl Into<String>, constructor: F)
    where
        F: Fn(JobSeed<'_>) -> Result<Box<dyn Job>, JobError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(job_type.into(), Box::new(constructor));
    }

    /// Register a job whose state is its serde representation.
    ///
    /// Records are decoded with `serde_json::from_value(data)`. Schedule
    /// metadata is decoded from a JSON object of string values, so metadata
    /// keys map onto the job's (string) fields.
    pub fn register_serde<J>(&mut self, job_type: impl Into<String>)
    where
        J: Job + DeserializeOwned,
    {
        self.register(job_type, |seed| {
            let value = match seed {
                JobSeed::Data(data) => data.clone(),
                JobSeed::Metadata(metadata) => metadata_to_json(metadata),
            };
            let job: J = serde_json::from_value(value)?;
            Ok(Box::new(job) as Box<dyn Job>)
        });
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.constructors.contains_key(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Rebuild the job stored in a record.
    pub fn resolve(&self, record: &JobRecord) -> DomainResult<Box<dyn Job>> {
        self.construct(&record.job_type, JobSeed::Data(&record.data))
    }

    /// Build the job for a new occurrence of a schedule.
    pub fn create_for_schedule(&self, schedule: &ScheduleDefinition) -> DomainResult<Box<dyn Job>> {
        self.construct(&schedule.job_type, JobSeed::Metadata(&schedule.metadata))
    }

    fn construct(&self, job_type: &str, seed: JobSeed<'_>) -> DomainResult<Box<dyn Job>> {
        let constructor = self
            .constructors
            .get(job_type)
            .ok_or_else(|| DomainError::unknown_job_type(job_type))?;

        constructor(seed).map_err(|e| DomainError::invalid_job_data(job_type, e.to_string()))
    }
}

impl core::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut keys: Vec<_> = self.job_types().collect();
        keys.sort_unstable();
        f.debug_struct("JobRegistry").field("job_types", &keys).finish()
    }
}

fn metadata_to_json(metadata: &JobMetadata) -> JsonValue {
    JsonValue::Object(
        metadata
            .iter()
            .map(|(k, v)| (k.clone(), JsonValue::String(v.clone())))
            .collect(),
    )
}
