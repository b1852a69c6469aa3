// ABOUTME: Common utilities and helpers for integration tests
// ABOUTME: Provides a scripted backend, a manual clock and a runtime harness for driving tasks

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use waypoint::backends::{OperationBackend, ProbeStatus};
use waypoint::config::EngineConfig;
use waypoint::engine::{
    ContextStatus, ManualClock, Result as EngineResult, Runtime, StateHandler, StateRegistry,
    StepContext,
};
use waypoint::operation::{Operation, OperationError, OperationId, OperationResult, Result};
use waypoint::signal::InMemorySignalTransport;

pub const SCRIPTED_BACKEND: &str = "scripted";
pub const START_TIME: i64 = 1_000;

/// Backend whose probe answers are set by the test.
#[derive(Default)]
pub struct ScriptedBackend {
    statuses: Mutex<HashMap<OperationId, ProbeStatus>>,
    progress: Mutex<HashMap<OperationId, u64>>,
    killed: Mutex<Vec<OperationId>>,
    unavailable: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_status(&self, id: &OperationId, status: ProbeStatus) {
        self.statuses.lock().unwrap().insert(id.clone(), status);
    }

    pub fn finish(&self, id: &OperationId, exit_code: i32) {
        let mut result = OperationResult::new();
        result.set_id(id.clone()).unwrap();
        result.set_exit_code(exit_code).unwrap();
        self.set_status(id, ProbeStatus::Finished(result));
    }

    pub fn set_progress(&self, id: &OperationId, bytes: u64) {
        self.progress.lock().unwrap().insert(id.clone(), bytes);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn killed(&self) -> Vec<OperationId> {
        self.killed.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperationBackend for ScriptedBackend {
    fn kind(&self) -> &str {
        SCRIPTED_BACKEND
    }

    async fn probe_status(&self, operation: &Operation) -> Result<ProbeStatus> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(OperationError::unavailable(SCRIPTED_BACKEND, "scripted outage"));
        }
        let id = operation.id()?;
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or(ProbeStatus::Running))
    }

    async fn kill(&self, operation: &Operation) -> Result<bool> {
        self.killed.lock().unwrap().push(operation.id()?.clone());
        Ok(true)
    }

    async fn fetch_progress(&self, operation: &Operation) -> Result<Option<u64>> {
        Ok(self.progress.lock().unwrap().get(operation.id()?).copied())
    }
}

/// Operation on the scripted backend with id `host:pid@started_at`.
pub fn scripted_operation(host: &str, pid: u32, started_at: i64, owner: &str) -> Operation {
    let mut operation = Operation::new(SCRIPTED_BACKEND, format!("job on {}", host));
    operation
        .set_id(OperationId::remote(host, pid, started_at))
        .unwrap();
    operation.set_owner_id(owner).unwrap();
    operation.set_start_time(started_at).unwrap();
    operation
}

/// Maps the aggregate status of the current context onto transition values.
pub struct AwaitOperations;

#[async_trait]
impl StateHandler for AwaitOperations {
    async fn run(&self, step: &mut StepContext<'_>) -> EngineResult<String> {
        let value = match step.status().await? {
            ContextStatus::Success => "success",
            ContextStatus::Fail => "failure",
            ContextStatus::Wait | ContextStatus::Uninitialized => "pending",
        };
        Ok(value.to_string())
    }
}

/// Start state logic that launches one scripted operation into a fresh `wait` context.
pub fn launch_state(
    host: &'static str,
    pid: u32,
) -> impl for<'a, 'b> Fn(&'a mut StepContext<'b>) -> EngineResult<String> + Send + Sync + 'static {
    move |step: &mut StepContext<'_>| {
        let operation = scripted_operation(host, pid, step.now(), step.task_id());
        let wait = step.context_for("wait")?;
        wait.clear();
        wait.add_operation(operation)?;
        Ok("launch".to_string())
    }
}

pub const DEPLOY_TABLE: &str = "\
# launch one job and wait for it
start  launch   wait         0   0
wait   pending  wait         10  0
wait   success  @complete    0   0
wait   failure  @user_error  0   0
";

pub fn deploy_states() -> StateRegistry {
    StateRegistry::new()
        .with_fn("start", launch_state("server1", 42))
        .with_state("wait", Arc::new(AwaitOperations))
}

pub struct Harness {
    pub runtime: Runtime,
    pub backend: Arc<ScriptedBackend>,
    pub transport: Arc<InMemorySignalTransport>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(states: StateRegistry) -> Self {
        Self::with_config(states, EngineConfig::default())
    }

    pub fn with_config(states: StateRegistry, config: EngineConfig) -> Self {
        let backend = ScriptedBackend::new();
        let transport = Arc::new(InMemorySignalTransport::new());
        let clock = Arc::new(ManualClock::new(START_TIME));
        let runtime = Runtime::new(states, config)
            .with_backend(backend.clone())
            .with_transport(transport.clone())
            .with_clock(clock.clone());
        Self {
            runtime,
            backend,
            transport,
            clock,
        }
    }
}
