//! Job status state machine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a job record.
///
/// Legal transitions:
///
/// - `Queued -> Started` (dequeue claim)
/// - `Started -> Canceling` (external cancel request)
/// - `Canceling -> Canceled` (runner observed the request and aborted)
/// - `Started -> Succeeded | Failed | TimedOut` (execution outcome)
///
/// Everything else is rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed by a runner
    Queued,
    /// Claimed and executing
    Started,
    /// Cancellation requested, not yet observed by the runner
    Canceling,
    /// Aborted after a cancel request
    Canceled,
    /// Execution returned without error
    Succeeded,
    /// Execution returned an error
    Failed,
    /// Execution exceeded its timeout budget
    TimedOut,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Queued,
        JobStatus::Started,
        JobStatus::Canceling,
        JobStatus::Canceled,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::TimedOut,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Canceled | JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Started)
                | (Started, Canceling)
                | (Canceling, Canceled)
                | (Started, Succeeded)
                | (Started, Failed)
                | (Started, TimedOut)
        )
    }

    /// Stable storage form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Started => "started",
            JobStatus::Canceling => "canceling",
            JobStatus::Canceled => "canceled",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("invalid job status: {s}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_six_lifecycle_edges_are_legal() {
        use JobStatus::*;
        let legal = [
            (Queued, Started),
            (Started, Canceling),
            (Canceling, Canceled),
            (Started, Succeeded),
            (Started, Failed),
            (Started, TimedOut),
        ];

        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {}",
                    if expected { "legal" } else { "illegal" }
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_way_out() {
        for from in JobStatus::ALL.into_iter().filter(JobStatus::is_terminal) {
            assert!(JobStatus::ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn storage_form_parses_back() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
    }

    #[test]
    fn serde_uses_storage_form() {
        let json = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
