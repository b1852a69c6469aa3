// ABOUTME: Outcome returned by each interpreter step
// ABOUTME: Carries the suggested wait, completion flag, status and exit message

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::operation::Timestamp;
use crate::scheduling::ExitStatus;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Terminated,
    Warning,
    SystemError,
    UserError,
}

impl StepStatus {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            StepStatus::Ok => ExitStatus::Completed,
            StepStatus::Terminated => ExitStatus::Terminated,
            StepStatus::Warning => ExitStatus::Warning,
            StepStatus::SystemError => ExitStatus::ErrorSystem,
            StepStatus::UserError => ExitStatus::ErrorUser,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOutcome {
    pub task_id: String,
    /// State the step ran.
    pub from_state: String,
    /// State the next step will run; equal to `from_state` once the task is finished.
    pub state: String,
    pub transition_value: Option<String>,
    /// Suggested time before the next step.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    pub complete: bool,
    pub status: StepStatus,
    pub exit_message: Option<String>,
    pub signals_processed: usize,
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(
            self.status,
            StepStatus::SystemError | StepStatus::UserError | StepStatus::Terminated
        )
    }

    pub fn wake_at(&self, now: Timestamp) -> Timestamp {
        let delay = i64::try_from(self.delay.as_secs()).unwrap_or(i64::MAX);
        now.saturating_add(delay)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Ok => write!(f, "ok"),
            StepStatus::Terminated => write!(f, "terminated"),
            StepStatus::Warning => write!(f, "warning"),
            StepStatus::SystemError => write!(f, "system_error"),
            StepStatus::UserError => write!(f, "user_error"),
        }
    }
}
