// ABOUTME: State logic registered per state name and the context it runs with
// ABOUTME: Handlers return a transition value; the step context exposes contexts, backends and time

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::context::{ContextStatus, ContextStore, ExecutionContext};
use super::error::Result;
use super::runtime::Runtime;
use crate::backends::{BackendRegistry, OperationBackend};
use crate::config::EngineConfig;
use crate::operation::{Operation, OperationId, Timestamp};
use crate::scheduling::TaskMetadata;
use crate::signal::Correlator;

/// Transition-decision logic for one state.
///
/// Must not block on remote work: start operations, then return a value whose
/// table rule waits and loops back to check [`StepContext::status`].
#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn run(&self, step: &mut StepContext<'_>) -> Result<String>;
}

/// Adapts a synchronous closure into a [`StateHandler`].
pub struct FnState<F>(pub F);

#[async_trait]
impl<F> StateHandler for FnState<F>
where
    F: for<'a, 'b> Fn(&'a mut StepContext<'b>) -> Result<String> + Send + Sync,
{
    async fn run(&self, step: &mut StepContext<'_>) -> Result<String> {
        (self.0)(step)
    }
}

#[derive(Clone, Default)]
pub struct StateRegistry {
    handlers: HashMap<String, Arc<dyn StateHandler>>,
}

impl std::fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateRegistry")
            .field("states", &self.names())
            .finish()
    }
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, state: impl Into<String>, handler: Arc<dyn StateHandler>) {
        self.handlers.insert(state.into(), handler);
    }

    pub fn register_fn<F>(&mut self, state: impl Into<String>, f: F)
    where
        F: for<'a, 'b> Fn(&'a mut StepContext<'b>) -> Result<String> + Send + Sync + 'static,
    {
        self.register(state, Arc::new(FnState(f)));
    }

    pub fn with_state(mut self, state: impl Into<String>, handler: Arc<dyn StateHandler>) -> Self {
        self.register(state, handler);
        self
    }

    pub fn with_fn<F>(mut self, state: impl Into<String>, f: F) -> Self
    where
        F: for<'a, 'b> Fn(&'a mut StepContext<'b>) -> Result<String> + Send + Sync + 'static,
    {
        self.register_fn(state, f);
        self
    }

    pub fn get(&self, state: &str) -> Option<Arc<dyn StateHandler>> {
        self.handlers.get(state).cloned()
    }

    pub fn contains(&self, state: &str) -> bool {
        self.handlers.contains_key(state)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// What a state handler sees during one step.
pub struct StepContext<'a> {
    task_id: &'a str,
    state: &'a str,
    now: Timestamp,
    contexts: &'a mut ContextStore,
    metadata: &'a TaskMetadata,
    runtime: &'a Runtime,
}

impl<'a> StepContext<'a> {
    pub(crate) fn new(
        task_id: &'a str,
        state: &'a str,
        now: Timestamp,
        contexts: &'a mut ContextStore,
        metadata: &'a TaskMetadata,
        runtime: &'a Runtime,
    ) -> Self {
        Self {
            task_id,
            state,
            now,
            contexts,
            metadata,
            runtime,
        }
    }

    pub fn task_id(&self) -> &str {
        self.task_id
    }

    pub fn state(&self) -> &str {
        self.state
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn metadata(&self) -> &TaskMetadata {
        self.metadata
    }

    pub fn config(&self) -> &EngineConfig {
        self.runtime.config()
    }

    pub fn backends(&self) -> &BackendRegistry {
        self.runtime.backends()
    }

    pub fn backend(&self, kind: &str) -> Result<Arc<dyn OperationBackend>> {
        Ok(self.runtime.backends().require(kind)?)
    }

    pub fn correlator(&self) -> &Correlator {
        self.runtime.correlator()
    }

    /// The current state's context, following links.
    pub fn context(&mut self) -> Result<&mut ExecutionContext> {
        self.contexts.get_mut(self.state)
    }

    pub fn context_for(&mut self, name: &str) -> Result<&mut ExecutionContext> {
        self.contexts.get_mut(name)
    }

    /// Aliases the current state's context to the context of `target`.
    pub fn link_context(&mut self, target: &str) -> Result<()> {
        self.contexts.link(self.state, target)
    }

    /// Tracks `operation` in the current state's context.
    pub fn add_operation(&mut self, operation: Operation) -> Result<()> {
        self.context()?.add_operation(operation)?;
        Ok(())
    }

    /// Aggregate status of the current state's context.
    pub async fn status(&mut self) -> Result<ContextStatus> {
        let runtime = self.runtime;
        let now = self.now;
        let context = self.contexts.get_mut(self.state)?;
        Ok(context
            .get_status(runtime.correlator(), runtime.backends(), now)
            .await?)
    }

    /// Force-fails one outstanding operation. Returns `false` if it is not tracked here.
    pub async fn force_fail(&mut self, id: &OperationId, reason: &str) -> Result<bool> {
        let runtime = self.runtime;
        let now = self.now;
        let context = self.contexts.get_mut(self.state)?;
        let Some(operation) = context.operation_mut(id) else {
            return Ok(false);
        };
        runtime
            .correlator()
            .force_fail(operation, runtime.backends(), reason, now)
            .await?;
        Ok(true)
    }

    /// Force-fails every operation the last status check reported as stalled.
    pub async fn force_fail_stalled(&mut self, reason: &str) -> Result<usize> {
        let stalled: Vec<OperationId> = self.context()?.stalled_operations().cloned().collect();
        let mut failed = 0;
        for id in &stalled {
            if self.force_fail(id, reason).await? {
                failed += 1;
            }
        }
        Ok(failed)
    }
}
