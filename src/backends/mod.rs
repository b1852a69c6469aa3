// ABOUTME: Capability interface implemented by each backend that executes operations
// ABOUTME: Provides the registry used to find the backend able to probe, kill and release an operation

pub mod command;
pub mod subtask;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::operation::{Operation, OperationError, OperationResult, Result};

pub use command::{ExecOutput, ExecRequest, LocalExecBackend, LOCAL_EXEC_BACKEND};
pub use subtask::{InMemorySubTaskStore, SubTaskBackend, SubTaskStore, SUBTASK_BACKEND};

/// Answer to a synchronous status probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStatus {
    /// The backend knows the operation and it is still executing.
    Running,
    /// The operation finished; the backend produced its result.
    Finished(OperationResult),
    /// The backend holds no record of the operation (yet, or any more).
    Unknown,
}

#[async_trait]
pub trait OperationBackend: Send + Sync {
    /// Registry key; operations name their backend with the same string.
    fn kind(&self) -> &str;

    async fn probe_status(&self, operation: &Operation) -> Result<ProbeStatus>;

    /// Best-effort termination. Returns whether the operation is (being) stopped.
    ///
    /// Backends without kill support report the current completion state.
    async fn kill(&self, operation: &Operation) -> Result<bool> {
        Ok(operation.has_completed())
    }

    /// Monotonically growing proxy for progress, if the backend has one.
    async fn fetch_progress(&self, _operation: &Operation) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Frees backend-side resources once the result has been retrieved.
    async fn release(&self, _operation: &Operation) -> Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct BackendRegistry {
    implementations: HashMap<String, Arc<dyn OperationBackend>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.list_kinds())
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, implementation: Arc<dyn OperationBackend>) {
        let kind = implementation.kind().to_string();
        self.implementations.insert(kind, implementation);
    }

    pub fn with_backend(mut self, implementation: Arc<dyn OperationBackend>) -> Self {
        self.register(implementation);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn OperationBackend>> {
        self.implementations.get(kind).cloned()
    }

    /// Looks up a backend, treating an unregistered kind as misconfiguration.
    pub fn require(&self, kind: &str) -> Result<Arc<dyn OperationBackend>> {
        self.get(kind).ok_or_else(|| {
            OperationError::Configuration(format!(
                "no backend registered for operation kind '{}' (registered: {:?})",
                kind,
                self.list_kinds()
            ))
        })
    }

    pub fn list_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.implementations.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        kinds
    }
}
