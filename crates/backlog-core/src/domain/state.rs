//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a task.
///
/// State transitions:
/// - Pending -> Running (claim)
/// - Running -> Completed
/// - Running -> Failed
/// - Failed -> Pending (automatic re-queue while retries remain)
///
/// Completed is terminal. Failed is terminal once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting to be claimed (possibly not before `scheduled_at`).
    Pending,

    /// Claimed by a worker.
    Running,

    /// Finished successfully.
    Completed,

    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Is `self -> next` an edge of the state machine?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
        )
    }

    /// Does this status carry a `completed_at`?
    pub fn is_finished(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for an unrecognised status string (store rows, CLI flags).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TaskStatus::Pending, TaskStatus::Running, true)]
    #[case(TaskStatus::Running, TaskStatus::Completed, true)]
    #[case(TaskStatus::Running, TaskStatus::Failed, true)]
    #[case(TaskStatus::Failed, TaskStatus::Pending, true)]
    #[case(TaskStatus::Pending, TaskStatus::Completed, false)]
    #[case(TaskStatus::Pending, TaskStatus::Failed, false)]
    #[case(TaskStatus::Completed, TaskStatus::Pending, false)]
    #[case(TaskStatus::Completed, TaskStatus::Running, false)]
    #[case(TaskStatus::Failed, TaskStatus::Running, false)]
    #[case(TaskStatus::Running, TaskStatus::Pending, false)]
    #[case(TaskStatus::Running, TaskStatus::Running, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] ok: bool) {
        assert_eq!(from.can_transition_to(to), ok);
    }

    #[test]
    fn status_string_roundtrip() {
        for st in TaskStatus::ALL {
            assert_eq!(st.as_str().parse::<TaskStatus>().unwrap(), st);
        }
        assert!("DEAD".parse::<TaskStatus>().is_err());
    }
}
