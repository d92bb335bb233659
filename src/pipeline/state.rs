use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle shared by batch jobs and sync sessions.
///
/// `Pending -> Processing -> {Paused <-> Processing} -> {Completed | Failed | Cancelled}`.
/// Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, JobState::Processing | JobState::Paused)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Processing) | (Pending, Cancelled) => true,
            (Processing, Paused) | (Paused, Processing) => true,
            (Processing, Completed) | (Processing, Failed) | (Processing, Cancelled) => true,
            // The last in-flight record may finish after a pause was requested.
            (Paused, Completed) | (Paused, Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Paused => "paused",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
