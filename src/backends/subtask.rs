// ABOUTME: Backend that tracks nested tasks through a sub-task store
// ABOUTME: A sub-task is finished once its exit status leaves not-finished

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{OperationBackend, ProbeStatus};
use crate::engine::{Clock, SystemClock};
use crate::operation::{
    Operation, OperationError, OperationId, OperationResult, Result, Timestamp,
};
use crate::scheduling::{ExitStatus, TaskMetadata, TaskStatus};

pub const SUBTASK_BACKEND: &str = "subtask";

/// Read side of wherever sub-task records are persisted.
#[async_trait]
pub trait SubTaskStore: Send + Sync {
    async fn metadata(&self, task_id: &str) -> Result<Option<TaskMetadata>>;

    async fn result(&self, task_id: &str) -> Result<Option<OperationResult>>;

    /// Marks an unfinished sub-task terminated. Returns whether it is now finished.
    async fn terminate(&self, task_id: &str, reason: &str, now: Timestamp) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct SubTaskRecord {
    metadata: TaskMetadata,
    result: Option<OperationResult>,
    termination_reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct InMemorySubTaskStore {
    tasks: RwLock<HashMap<String, SubTaskRecord>>,
}

impl InMemorySubTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, metadata: TaskMetadata) {
        let mut tasks = self.tasks.write().await;
        tasks.insert(
            metadata.task_id.clone(),
            SubTaskRecord {
                metadata,
                result: None,
                termination_reason: None,
            },
        );
    }

    /// Records a sub-task's final exit status and, optionally, its result.
    pub async fn finish(
        &self,
        task_id: &str,
        exit_status: ExitStatus,
        result: Option<OperationResult>,
        now: Timestamp,
    ) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        let record = tasks.get_mut(task_id).ok_or_else(|| {
            OperationError::invalid("task_id", format!("unknown sub-task '{}'", task_id))
        })?;

        record
            .metadata
            .set_exit_status(exit_status, now)
            .map_err(|e| OperationError::invalid("exit_status", e.to_string()))?;
        record.metadata.set_status(TaskStatus::Complete, now);
        record.result = result;
        Ok(())
    }

    pub async fn remove(&self, task_id: &str) -> bool {
        self.tasks.write().await.remove(task_id).is_some()
    }

    pub async fn termination_reason(&self, task_id: &str) -> Option<String> {
        let tasks = self.tasks.read().await;
        tasks
            .get(task_id)
            .and_then(|record| record.termination_reason.clone())
    }
}

#[async_trait]
impl SubTaskStore for InMemorySubTaskStore {
    async fn metadata(&self, task_id: &str) -> Result<Option<TaskMetadata>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(task_id).map(|record| record.metadata.clone()))
    }

    async fn result(&self, task_id: &str) -> Result<Option<OperationResult>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(task_id).and_then(|record| record.result.clone()))
    }

    async fn terminate(&self, task_id: &str, reason: &str, now: Timestamp) -> Result<bool> {
        let mut tasks = self.tasks.write().await;
        let Some(record) = tasks.get_mut(task_id) else {
            return Ok(false);
        };
        if record.metadata.exit_status().is_finished() {
            return Ok(true);
        }
        record
            .metadata
            .set_exit_status(ExitStatus::Terminated, now)
            .map_err(|e| OperationError::invalid("exit_status", e.to_string()))?;
        record.metadata.set_status(TaskStatus::Complete, now);
        record.termination_reason = Some(reason.to_string());
        Ok(true)
    }
}

pub struct SubTaskBackend {
    store: Arc<dyn SubTaskStore>,
    clock: Arc<dyn Clock>,
}

impl SubTaskBackend {
    pub fn new(store: Arc<dyn SubTaskStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Operation tracking the sub-task `task_id` on behalf of `owner_id`.
    ///
    /// Completed and warning exit statuses both count as success.
    pub fn operation_for(task_id: &str, owner_id: &str, now: Timestamp) -> Result<Operation> {
        let mut operation = Operation::new(SUBTASK_BACKEND, format!("sub-task {}", task_id));
        operation.set_id(OperationId::task(task_id))?;
        operation.set_owner_id(owner_id)?;
        operation.set_start_time(now)?;
        operation.set_success_codes(
            [ExitStatus::Completed, ExitStatus::Warning]
                .iter()
                .filter_map(ExitStatus::process_exit_code),
        )?;
        Ok(operation)
    }

    fn task_id(operation: &Operation) -> Result<&str> {
        match operation.id()? {
            OperationId::Task(task_id) => Ok(task_id),
            other => Err(OperationError::invalid(
                "id",
                format!("'{}' is not a sub-task id", other),
            )),
        }
    }

    fn synthesize_result(operation: &Operation, metadata: &TaskMetadata) -> Result<OperationResult> {
        let exit_status = metadata.exit_status();
        let mut result = OperationResult::for_operation(operation);
        if result.exit_code().is_err() {
            result.set_exit_code(exit_status.process_exit_code().unwrap_or(-1))?;
        }
        if result.exit_message().is_err() {
            result.set_exit_message(format!(
                "sub-task {} finished with {}",
                metadata.task_id, exit_status
            ))?;
        }
        if result.end_time().is_err() {
            let start = result.start_time().unwrap_or(metadata.updated_at);
            result.set_end_time(metadata.updated_at.max(start))?;
        }
        Ok(result)
    }
}

#[async_trait]
impl OperationBackend for SubTaskBackend {
    fn kind(&self) -> &str {
        SUBTASK_BACKEND
    }

    async fn probe_status(&self, operation: &Operation) -> Result<ProbeStatus> {
        let task_id = Self::task_id(operation)?;
        let Some(metadata) = self.store.metadata(task_id).await? else {
            debug!("Sub-task {} has no record", task_id);
            return Ok(ProbeStatus::Unknown);
        };

        if !metadata.exit_status().is_finished() {
            return Ok(ProbeStatus::Running);
        }

        let result = match self.store.result(task_id).await? {
            Some(result) => result,
            None => Self::synthesize_result(operation, &metadata)?,
        };
        Ok(ProbeStatus::Finished(result))
    }

    async fn kill(&self, operation: &Operation) -> Result<bool> {
        let task_id = Self::task_id(operation)?;
        let now = self.clock.now();
        let stopped = self
            .store
            .terminate(task_id, "terminated by parent task", now)
            .await?;
        if stopped {
            info!("Terminated sub-task {}", task_id);
        }
        Ok(stopped)
    }
}
