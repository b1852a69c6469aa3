// ABOUTME: Operation model for work executing outside this process
// ABOUTME: Exports operations, their results, identifiers and write-once field handling

pub mod error;
pub mod fields;
pub mod id;
pub mod process;
pub mod result;

pub use error::{OperationError, Result};
pub use fields::{Timestamp, WriteOnce};
pub use id::OperationId;
pub use process::{Operation, ProgressTracker};
pub use result::{OperationResult, ResultPayload};

/// Reserved exit code marking a force-failed operation or result.
pub const FORCE_FAILED_EXIT_CODE: i32 = 999_999;
