// ABOUTME: Error types for operation and result field access
// ABOUTME: Separates not-yet-available reads from invalid input, configuration and backend failures

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("Field not yet available: {field}")]
    NotYetAvailable { field: &'static str },

    #[error("Field already set: {field}")]
    AlreadySet { field: &'static str },

    #[error("Invalid value for {field}: {reason}")]
    InvalidArgument { field: &'static str, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },
}

impl OperationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        OperationError::InvalidArgument {
            field,
            reason: reason.into(),
        }
    }

    pub fn unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        OperationError::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Errors worth retrying on a later wake-up.
    pub fn is_transient(&self) -> bool {
        matches!(self, OperationError::BackendUnavailable { .. })
    }

    /// Errors that indicate a broken invariant in calling code.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            OperationError::NotYetAvailable { .. } | OperationError::AlreadySet { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;
