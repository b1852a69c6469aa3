// ABOUTME: Task scheduling metadata read and written around each interpreter step
// ABOUTME: The scheduler itself lives elsewhere; this module only holds its record and rules

pub mod error;
pub mod lease;
pub mod metadata;

pub use error::SchedulingError;
pub use lease::Lease;
pub use metadata::{ExitStatus, Priority, RunRecord, TaskMetadata, TaskStatus};
