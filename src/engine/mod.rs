// ABOUTME: State-table interpreter for waypoint tasks
// ABOUTME: Compiles transition tables, runs state logic per step and persists interpreter state

pub mod clock;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod recording;
pub mod result;
pub mod runtime;
pub mod snapshot;
pub mod state;
pub mod table;

pub use clock::{Clock, ManualClock, StepTimer, SystemClock};
pub use context::{ContextStatus, ContextStore, ExecutionContext, WaitState};
pub use error::{CompileError, EngineError, Result};
pub use interpreter::{InterpreterPhase, TaskInterpreter};
pub use recording::{RecordEntry, Recording, RecordingDiff};
pub use result::{StepOutcome, StepStatus};
pub use runtime::Runtime;
pub use snapshot::{TaskSnapshot, SNAPSHOT_VERSION};
pub use state::{FnState, StateHandler, StateRegistry, StepContext};
pub use table::{Destination, Terminal, Transition, TransitionTable, DEFAULT_TRANSITION};
