// ABOUTME: Scheduling record an external scheduler reads to pick the next task
// ABOUTME: Tracks status, exit status, priority, lease, wake time, group and rerun history

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{Result, SchedulingError};
use super::lease::Lease;
use crate::operation::Timestamp;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    NotReady,
    NotStarted,
    Waiting,
    Processing,
    Complete,
    Restarted,
}

impl TaskStatus {
    /// Changes into these statuses happen on every step and notify nobody.
    pub fn is_lifecycle_significant(&self) -> bool {
        !matches!(self, TaskStatus::Waiting | TaskStatus::Processing)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    NotFinished,
    Warning,
    ErrorUser,
    ErrorSystem,
    Terminated,
    Completed,
}

impl ExitStatus {
    pub fn is_finished(&self) -> bool {
        *self != ExitStatus::NotFinished
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExitStatus::ErrorUser | ExitStatus::ErrorSystem | ExitStatus::Terminated
        )
    }

    /// Exit code reported at the process boundary.
    pub fn process_exit_code(&self) -> Option<i32> {
        match self {
            ExitStatus::NotFinished => None,
            ExitStatus::Completed => Some(0),
            ExitStatus::Warning => Some(1),
            ExitStatus::ErrorUser => Some(2),
            ExitStatus::ErrorSystem => Some(3),
            ExitStatus::Terminated => Some(4),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

/// Outcome of one finished run, kept when a task is re-run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub run: u32,
    pub exit_status: ExitStatus,
    pub archived_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetadata {
    pub task_id: String,
    status: TaskStatus,
    exit_status: ExitStatus,
    pub priority: Priority,
    /// Same-group concurrency limits are enforced by the scheduler.
    pub group: Option<String>,
    lease: Option<Lease>,
    pub wake_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    run: u32,
    #[serde(default)]
    history: Vec<RunRecord>,
}

impl TaskMetadata {
    pub fn new(task_id: impl Into<String>, now: Timestamp) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskStatus::NotStarted,
            exit_status: ExitStatus::NotFinished,
            priority: Priority::default(),
            group: None,
            lease: None,
            wake_at: None,
            created_at: now,
            updated_at: now,
            run: 1,
            history: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Returns `true` when the change is lifecycle significant.
    pub fn set_status(&mut self, status: TaskStatus, now: Timestamp) -> bool {
        if self.status == status {
            return false;
        }
        self.status = status;
        self.updated_at = now;
        status.is_lifecycle_significant()
    }

    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
    }

    /// Marks true completion. Only one finished value per run is accepted.
    pub fn set_exit_status(&mut self, exit_status: ExitStatus, now: Timestamp) -> Result<()> {
        if !exit_status.is_finished() {
            return Err(SchedulingError::InvalidExitStatus(exit_status));
        }
        if self.exit_status.is_finished() {
            return Err(SchedulingError::ExitStatusAlreadySet {
                current: self.exit_status,
            });
        }
        self.exit_status = exit_status;
        self.updated_at = now;
        Ok(())
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    pub fn history(&self) -> &[RunRecord] {
        &self.history
    }

    /// Archives the current run and opens a new one with exit status not-finished.
    ///
    /// This is the only path back to not-finished; the archived status is kept.
    pub fn begin_rerun(&mut self, now: Timestamp) {
        self.history.push(RunRecord {
            run: self.run,
            exit_status: self.exit_status,
            archived_at: now,
        });
        self.run += 1;
        self.exit_status = ExitStatus::NotFinished;
        self.status = TaskStatus::Restarted;
        self.wake_at = None;
        self.updated_at = now;
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Claims the task for `worker`, failing while another worker holds a live lease.
    pub fn claim(&mut self, worker: &str, duration: Duration, now: Timestamp) -> Result<()> {
        if let Some(current) = &self.lease {
            if current.worker != worker && !current.is_expired(now) {
                return Err(SchedulingError::LeaseHeld {
                    holder: current.worker.clone(),
                    worker: worker.to_string(),
                });
            }
        }
        self.lease = Some(Lease::new(worker, now, duration));
        self.updated_at = now;
        Ok(())
    }

    pub fn check_lease(&self, worker: &str, now: Timestamp) -> Result<()> {
        self.lease
            .as_ref()
            .ok_or(SchedulingError::NotLeased)?
            .check_holder(worker, now)
    }

    pub fn release_lease(&mut self, worker: &str) -> Result<()> {
        if let Some(lease) = &self.lease {
            lease.verify_owner(worker)?;
        }
        self.lease = None;
        Ok(())
    }

    /// Whether a scheduler may hand this task out at `now`.
    pub fn is_runnable(&self, now: Timestamp) -> bool {
        !self.exit_status.is_finished()
            && self.status != TaskStatus::NotReady
            && self.wake_at.map_or(true, |at| at <= now)
            && self.lease.as_ref().map_or(true, |l| l.is_expired(now))
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::NotReady => write!(f, "not_ready"),
            TaskStatus::NotStarted => write!(f, "not_started"),
            TaskStatus::Waiting => write!(f, "waiting"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Restarted => write!(f, "restarted"),
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::NotFinished => write!(f, "not_finished"),
            ExitStatus::Warning => write!(f, "warning"),
            ExitStatus::ErrorUser => write!(f, "error_user"),
            ExitStatus::ErrorSystem => write!(f, "error_system"),
            ExitStatus::Terminated => write!(f, "terminated"),
            ExitStatus::Completed => write!(f, "completed"),
        }
    }
}
