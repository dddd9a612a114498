//! Runner configuration.
//!
//! Loaded once at startup from a TOML file; every field has a default so an
//! empty file is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use jobforge_core::ScheduleDefinition;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Settings of one job runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Interval between heartbeats, in milliseconds
    pub heartbeat_ms: u64,
    /// Upper bound on simultaneously active runs
    pub maximum_concurrency: usize,
    /// How many times a failed or timed-out job is re-queued
    pub maximum_failed_retries: u32,
    /// Delete claimed records whose job cannot be constructed
    pub delete_bad_scheduled_job_records: bool,
    /// Report claimed records whose job cannot be constructed via `on_error`
    pub notify_on_bad_scheduled_jobs: bool,
    /// How long an abort waits for the worker to honor cancellation
    pub abort_grace_ms: u64,
    pub schedules: Vec<ScheduleDefinition>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 1000,
            maximum_concurrency: 4,
            maximum_failed_retries: 0,
            delete_bad_scheduled_job_records: false,
            notify_on_bad_scheduled_jobs: true,
            abort_grace_ms: 1000,
            schedules: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Read, parse and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate TOML config text.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat_ms must be positive".into()));
        }
        if self.maximum_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "maximum_concurrency must be positive".into(),
            ));
        }

        for schedule in &self.schedules {
            schedule
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat_ms = heartbeat.as_millis() as u64;
        self
    }

    pub fn with_maximum_concurrency(mut self, max: usize) -> Self {
        self.maximum_concurrency = max;
        self
    }

    pub fn with_maximum_failed_retries(mut self, retries: u32) -> Self {
        self.maximum_failed_retries = retries;
        self
    }

    pub fn with_abort_grace(mut self, grace: Duration) -> Self {
        self.abort_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_schedule(mut self, schedule: ScheduleDefinition) -> Self {
        self.schedules.push(schedule);
        self
    }
}
