// ABOUTME: Main library module for the waypoint task interpreter
// ABOUTME: Exports the operation model, signal correlation, backends, engine and scheduling metadata

pub mod backends;
pub mod config;
pub mod engine;
pub mod operation;
pub mod scheduling;
pub mod signal;

// Re-export commonly used types
pub use backends::{BackendRegistry, OperationBackend, ProbeStatus};
pub use config::{init_logging, EngineConfig};
pub use engine::{
    ContextStatus, EngineError, ExecutionContext, Runtime, StateHandler, StateRegistry,
    StepContext, StepOutcome, StepStatus, TaskInterpreter,
};
pub use operation::{Operation, OperationError, OperationId, OperationResult, Timestamp};
pub use scheduling::{ExitStatus, TaskMetadata, TaskStatus};
pub use signal::{Correlator, Signal, SignalTransport};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
