//! Job types this worker knows how to run.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use jobforge_core::{Job, JobContext, JobError, JobRegistry};

/// Logs a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoJob {
    pub message: String,
}

impl Job for EchoJob {
    fn job_type(&self) -> &str {
        "echo"
    }

    fn name(&self) -> String {
        format!("echo: {}", self.message)
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        info!(job_id = %ctx.job_id(), message = %self.message, "echo");
        Ok(())
    }

    fn serialize_data(&self) -> Result<JsonValue, JobError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Sleeps for a while, honoring cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SleepJob {
    #[serde(deserialize_with = "number_or_string")]
    pub seconds: u64,
}

impl Job for SleepJob {
    fn job_type(&self) -> &str {
        "sleep"
    }

    fn name(&self) -> String {
        format!("sleep {}s", self.seconds)
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.seconds.saturating_mul(2).max(60))
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        ctx.sleep(Duration::from_secs(self.seconds))
    }

    fn serialize_data(&self) -> Result<JsonValue, JobError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Schedule metadata is all strings; stored records carry numbers.
fn number_or_string<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

pub fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register_serde::<EchoJob>("echo");
    registry.register_serde::<SleepJob>("sleep");
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobforge_core::{JobRecord, RepeatType, ScheduleDefinition};

    #[test]
    fn sleep_job_accepts_metadata_strings() {
        let schedule = ScheduleDefinition::new("nap", Utc::now(), RepeatType::Hourly, "sleep")
            .with_metadata("seconds", "3");
        let job = registry().create_for_schedule(&schedule).unwrap();
        assert_eq!(job.name(), "sleep 3s");
    }

    #[test]
    fn records_round_trip_through_the_registry() {
        let record = JobRecord::from_job(&EchoJob { message: "hi".into() }, Utc::now()).unwrap();
        let job = registry().resolve(&record).unwrap();
        assert_eq!(job.name(), "echo: hi");
    }
}
