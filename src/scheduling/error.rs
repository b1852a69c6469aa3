// ABOUTME: Error types for task scheduling metadata
// ABOUTME: Covers exit status write rules and lease ownership checks

use thiserror::Error;

use super::metadata::ExitStatus;
use crate::operation::Timestamp;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingError {
    #[error("Exit status already set to {current}")]
    ExitStatusAlreadySet { current: ExitStatus },

    #[error("Exit status cannot be set back to {0}")]
    InvalidExitStatus(ExitStatus),

    #[error("Lease is held by {holder}, not {worker}")]
    LeaseHeld { holder: String, worker: String },

    #[error("Lease held by {worker} expired at {expired_at}")]
    LeaseExpired { worker: String, expired_at: Timestamp },

    #[error("Task is not leased")]
    NotLeased,
}

pub type Result<T> = std::result::Result<T, SchedulingError>;
