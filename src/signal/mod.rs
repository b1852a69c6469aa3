// ABOUTME: Signal and poll correlation for outstanding operations
// ABOUTME: Exports completion signals, their transport and queue, and the correlator

pub mod correlator;
pub mod message;
pub mod queue;
pub mod transport;

pub use correlator::{Completion, Correlator, CorrelatorConfig};
pub use message::{Signal, SignalPayload};
pub use queue::SignalQueue;
pub use transport::{InMemorySignalTransport, SignalTransport};
