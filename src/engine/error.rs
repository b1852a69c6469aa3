// ABOUTME: Error types for state table compilation and task interpretation
// ABOUTME: Wraps operation and scheduling errors so callers can pick a recovery strategy

use thiserror::Error;

use crate::operation::OperationError;
use crate::scheduling::SchedulingError;

/// Malformed state table text. Line numbers are 1-based.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("State table is empty")]
    Empty,

    #[error("Line {line}: expected 5 fields (State Value Next Wait MaxAttempts), found {found}")]
    FieldCount { line: usize, found: usize },

    #[error("Line {line}: {field} must be a non-negative integer, got '{value}'")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },

    #[error("Line {line}: duplicate transition '{value}' for state '{state}'")]
    DuplicateTransition {
        line: usize,
        state: String,
        value: String,
    },

    #[error("Line {line}: state name '{state}' is reserved")]
    ReservedState { line: usize, state: String },

    #[error("Line {line}: unknown terminal destination '{name}'")]
    UnknownTerminal { line: usize, name: String },

    #[error("Line {line}: destination '{state}' is not defined as a state")]
    UndefinedState { line: usize, state: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("State table error: {0}")]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("No handler registered for state '{state}'")]
    MissingHandler { state: String },

    #[error("State '{state}' has no transition for value '{value}'")]
    UnmatchedTransition { state: String, value: String },

    #[error("Unknown state: {state}")]
    UnknownState { state: String },

    #[error("State '{state}' failed: {message}")]
    Handler { state: String, message: String },

    #[error("Context link error: {0}")]
    Link(String),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn handler(state: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Handler {
            state: state.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Operation(e) if e.is_transient())
    }

    /// Broken invariants in calling code; never converted into a task outcome.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, EngineError::Operation(e) if e.is_contract_violation())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
