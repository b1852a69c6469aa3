// ABOUTME: Collaborators injected into the interpreter at construction
// ABOUTME: Bundles state handlers, backends, signal transport, correlator, clock and configuration

use std::sync::Arc;

use super::clock::{Clock, SystemClock};
use super::state::StateRegistry;
use crate::backends::{BackendRegistry, OperationBackend};
use crate::config::EngineConfig;
use crate::operation::Timestamp;
use crate::signal::{Correlator, InMemorySignalTransport, SignalTransport};

pub struct Runtime {
    states: StateRegistry,
    backends: BackendRegistry,
    transport: Arc<dyn SignalTransport>,
    correlator: Correlator,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Runtime {
    /// Runtime with no backends, an in-memory transport and the system clock.
    pub fn new(states: StateRegistry, config: EngineConfig) -> Self {
        Self {
            states,
            backends: BackendRegistry::new(),
            transport: Arc::new(InMemorySignalTransport::new()),
            correlator: Correlator::new(config.correlator_config()),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn OperationBackend>) -> Self {
        self.backends.register(backend);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn SignalTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn states(&self) -> &StateRegistry {
        &self.states
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    pub fn transport(&self) -> &dyn SignalTransport {
        self.transport.as_ref()
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }
}
