// ABOUTME: Per-state execution context holding outstanding operations and collected results
// ABOUTME: Aggregates their status and supports read-through links between named contexts

use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use super::error::{EngineError, Result};
use crate::backends::BackendRegistry;
use crate::operation::{Operation, OperationError, OperationId, OperationResult, Timestamp};
use crate::signal::{Completion, Correlator, SignalQueue};

/// Aggregate decision over everything a context tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Success,
    Wait,
    Uninitialized,
    Fail,
}

/// Bookkeeping for how long a context has been waiting. Cleared on restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitState {
    pub started_at: Option<Timestamp>,
    pub polls: u32,
    pub last_polled_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    name: String,
    operations: BTreeMap<OperationId, Operation>,
    results: BTreeMap<OperationId, OperationResult>,
    #[serde(default)]
    stalled: BTreeSet<OperationId>,
    exit_code: Option<i32>,
    exit_message: Option<String>,
    #[serde(default)]
    wait: WaitState,
    /// State-local data without a dedicated field.
    #[serde(default)]
    values: BTreeMap<String, serde_json::Value>,
}

impl ExecutionContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        !self.operations.is_empty() || !self.results.is_empty()
    }

    pub fn add_operation(&mut self, operation: Operation) -> std::result::Result<(), OperationError> {
        let id = operation.id()?.clone();
        if self.operations.contains_key(&id) || self.results.contains_key(&id) {
            return Err(OperationError::invalid(
                "id",
                format!("{} is already tracked by context '{}'", id, self.name),
            ));
        }
        self.operations.insert(id, operation);
        Ok(())
    }

    /// Replaces every outstanding operation with `operation`.
    pub fn set_operation(&mut self, operation: Operation) -> std::result::Result<(), OperationError> {
        // Validate before clearing so a bad operation leaves the context untouched
        operation.id()?;
        self.clear_operations();
        self.add_operation(operation)
    }

    pub fn remove_operation(&mut self, id: &OperationId) -> Option<Operation> {
        self.stalled.remove(id);
        self.operations.remove(id)
    }

    pub fn operation(&self, id: &OperationId) -> Option<&Operation> {
        self.operations.get(id)
    }

    pub fn operation_mut(&mut self, id: &OperationId) -> Option<&mut Operation> {
        self.operations.get_mut(id)
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    pub fn outstanding(&self) -> usize {
        self.operations.len()
    }

    pub fn clear_operations(&mut self) {
        self.operations.clear();
        self.stalled.clear();
    }

    pub fn add_result(&mut self, result: OperationResult) -> std::result::Result<(), OperationError> {
        let id = result.id()?.clone();
        if self.results.contains_key(&id) {
            return Err(OperationError::invalid(
                "id",
                format!("context '{}' already holds a result for {}", self.name, id),
            ));
        }
        self.results.insert(id, result);
        Ok(())
    }

    pub fn set_result(&mut self, result: OperationResult) -> std::result::Result<(), OperationError> {
        result.id()?;
        self.clear_results();
        self.add_result(result)
    }

    pub fn remove_result(&mut self, id: &OperationId) -> Option<OperationResult> {
        self.results.remove(id)
    }

    pub fn result(&self, id: &OperationId) -> Option<&OperationResult> {
        self.results.get(id)
    }

    pub fn results(&self) -> impl Iterator<Item = &OperationResult> {
        self.results.values()
    }

    pub fn clear_results(&mut self) {
        self.results.clear();
    }

    /// Drops all operations and results.
    pub fn clear(&mut self) {
        self.clear_operations();
        self.clear_results();
    }

    /// Operations whose progress proxy stopped moving, as of the last status check.
    pub fn stalled_operations(&self) -> impl Iterator<Item = &OperationId> {
        self.stalled.iter()
    }

    pub fn tracked_ids(&self) -> impl Iterator<Item = &OperationId> {
        self.operations.keys().chain(self.results.keys())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, exit_code: i32) {
        self.exit_code = Some(exit_code);
    }

    pub fn exit_message(&self) -> Option<&str> {
        self.exit_message.as_deref()
    }

    pub fn set_exit_message(&mut self, message: impl Into<String>) {
        self.exit_message = Some(message.into());
    }

    pub fn wait(&self) -> &WaitState {
        &self.wait
    }

    pub fn reset_wait(&mut self) {
        self.wait = WaitState::default();
    }

    pub fn value<T: DeserializeOwned>(&self, key: &str) -> serde_json::Result<Option<T>> {
        self.values
            .get(key)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    pub fn set_value<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> serde_json::Result<()> {
        self.values.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove_value(&mut self, key: &str) -> Option<serde_json::Value> {
        self.values.remove(key)
    }

    pub fn has_value(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Checks every outstanding operation and rolls the outcome into one status.
    ///
    /// Completed operations move into the result set as a side effect. Running
    /// this twice never converts an operation twice. Transient backend errors
    /// leave the affected operation outstanding.
    pub async fn get_status(
        &mut self,
        correlator: &Correlator,
        backends: &BackendRegistry,
        now: Timestamp,
    ) -> std::result::Result<ContextStatus, OperationError> {
        if !self.is_initialized() {
            return Ok(ContextStatus::Uninitialized);
        }

        self.stalled.clear();
        let checks = self.operations.iter_mut().map(|(id, operation)| async move {
            (id.clone(), correlator.check(operation, backends, now).await)
        });
        let outcomes = join_all(checks).await;

        let mut collected = Vec::new();
        let mut fatal = None;
        for (id, outcome) in outcomes {
            match outcome {
                Ok(Completion::Completed) => collected.extend(self.convert(&id)),
                // Force-fail already released it
                Ok(Completion::Lost) => {
                    self.convert(&id);
                }
                Ok(Completion::Stalled) => {
                    self.stalled.insert(id);
                }
                Ok(Completion::Running) => {}
                Err(e) if e.is_transient() => {
                    warn!("Status of {} unavailable, checking again later: {}", id, e);
                }
                Err(e) => {
                    fatal.get_or_insert(e);
                }
            }
        }

        join_all(
            collected
                .iter()
                .map(|operation| correlator.release(operation, backends)),
        )
        .await;
        if let Some(e) = fatal {
            return Err(e);
        }

        if let Some(failed) = self.results.values().find(|r| !r.is_successful()) {
            debug!(
                "Context '{}' failed: {}",
                self.name,
                failed.exit_message().unwrap_or("unsuccessful exit code")
            );
            return Ok(ContextStatus::Fail);
        }

        if !self.operations.is_empty() {
            self.wait.started_at.get_or_insert(now);
            self.wait.polls += 1;
            self.wait.last_polled_at = Some(now);
            return Ok(ContextStatus::Wait);
        }

        Ok(ContextStatus::Success)
    }

    /// Routes queued signals to matching operations and marks them consumed.
    ///
    /// Returns how many results were attached.
    pub fn process_signals(&mut self, queue: &mut SignalQueue) -> usize {
        let matching: Vec<_> = queue
            .pending()
            .filter(|s| {
                self.operations.contains_key(&s.operation_id)
                    || self.results.contains_key(&s.operation_id)
            })
            .map(|s| s.signal_id)
            .collect();

        let mut processed = 0;
        for signal_id in matching {
            let Some(signal) = queue.take(signal_id) else {
                continue;
            };
            queue.mark_consumed(signal_id, signal.received_at);

            let Some(operation) = self.operations.get_mut(&signal.operation_id) else {
                debug!(
                    "Signal {} arrived after {} already has a result",
                    signal_id, signal.operation_id
                );
                continue;
            };
            match Correlator::apply_signal(operation, &signal) {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => warn!("Discarding signal {}: {}", signal_id, e),
            }
        }
        processed
    }

    /// Moves an operation into the result set and hands it back for release.
    fn convert(&mut self, id: &OperationId) -> Option<Operation> {
        self.stalled.remove(id);
        let operation = self.operations.remove(id)?;
        let result = match operation.result() {
            Some(result) => result.clone(),
            None => OperationResult::for_operation(&operation),
        };
        self.results.entry(id.clone()).or_insert(result);
        Some(operation)
    }
}

/// All contexts of one task, keyed by state name, plus links between names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextStore {
    contexts: BTreeMap<String, ExecutionContext>,
    #[serde(default)]
    links: BTreeMap<String, String>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follows links from `name` to the context that owns the storage.
    pub fn resolve(&self, name: &str) -> Result<String> {
        let mut current = name;
        let mut visited = BTreeSet::from([name]);
        while let Some(next) = self.links.get(current) {
            if !visited.insert(next.as_str()) {
                return Err(EngineError::Link(format!(
                    "context links starting at '{}' form a cycle",
                    name
                )));
            }
            current = next;
        }
        Ok(current.to_string())
    }

    pub fn get(&self, name: &str) -> Option<&ExecutionContext> {
        let resolved = self.resolve(name).ok()?;
        self.contexts.get(&resolved)
    }

    /// Link-resolved context for `name`, created on first use.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut ExecutionContext> {
        let resolved = self.resolve(name)?;
        Ok(self
            .contexts
            .entry(resolved.clone())
            .or_insert_with(|| ExecutionContext::new(resolved)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Makes `name` a read-through alias of `target`.
    ///
    /// Anything stored under `name` itself is dropped.
    pub fn link(&mut self, name: &str, target: &str) -> Result<()> {
        if name == target {
            return Err(EngineError::Link(format!(
                "context '{}' cannot be linked to itself",
                name
            )));
        }
        if self.resolve(target)? == name {
            return Err(EngineError::Link(format!(
                "linking '{}' to '{}' would form a cycle",
                name, target
            )));
        }

        if let Some(own) = self.contexts.remove(name) {
            if own.is_initialized() {
                warn!(
                    "Context '{}' dropped {} operations and {} results when linked to '{}'",
                    name,
                    own.operations.len(),
                    own.results.len(),
                    target
                );
            }
        }
        debug!("Linked context '{}' to '{}'", name, target);
        self.links.insert(name.to_string(), target.to_string());
        Ok(())
    }

    pub fn unlink(&mut self, name: &str) -> bool {
        self.links.remove(name).is_some()
    }

    pub fn linked_to(&self, name: &str) -> Option<&str> {
        self.links.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExecutionContext)> {
        self.contexts.iter().map(|(name, ctx)| (name.as_str(), ctx))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn reset_wait_bookkeeping(&mut self) {
        for context in self.contexts.values_mut() {
            context.reset_wait();
        }
    }

    /// Ids of every operation or result held by any context.
    pub fn tracked_ids(&self) -> BTreeSet<OperationId> {
        self.contexts
            .values()
            .flat_map(|ctx| ctx.tracked_ids().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{OperationBackend, ProbeStatus};
    use crate::operation::OperationId;
    use crate::signal::Signal;
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Operations whose pid is even have finished successfully, odd pids still run.
    struct ParityBackend;

    #[async_trait]
    impl OperationBackend for ParityBackend {
        fn kind(&self) -> &str {
            "parity"
        }

        async fn probe_status(
            &self,
            operation: &Operation,
        ) -> crate::operation::Result<ProbeStatus> {
            match operation.id()? {
                OperationId::Remote { pid, .. } if pid % 2 == 0 => {
                    let mut result = OperationResult::new();
                    result.set_exit_code(0)?;
                    Ok(ProbeStatus::Finished(result))
                }
                _ => Ok(ProbeStatus::Running),
            }
        }
    }

    fn op(pid: u32) -> Operation {
        let mut operation = Operation::new("parity", format!("job {}", pid));
        operation
            .set_id(OperationId::remote("server1", pid, 1000))
            .unwrap();
        operation.set_start_time(1000).unwrap();
        operation
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new().with_backend(Arc::new(ParityBackend))
    }

    async fn status(ctx: &mut ExecutionContext) -> ContextStatus {
        ctx.get_status(&Correlator::default(), &registry(), 2000)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_context_is_uninitialized() {
        let mut ctx = ExecutionContext::new("A");
        assert_eq!(status(&mut ctx).await, ContextStatus::Uninitialized);
    }

    #[tokio::test]
    async fn test_all_completed_is_success_and_converted() {
        let mut ctx = ExecutionContext::new("A");
        ctx.add_operation(op(2)).unwrap();
        ctx.add_operation(op(4)).unwrap();

        assert_eq!(status(&mut ctx).await, ContextStatus::Success);
        assert_eq!(ctx.outstanding(), 0);
        assert_eq!(ctx.results().count(), 2);

        // A second pass converts nothing new
        assert_eq!(status(&mut ctx).await, ContextStatus::Success);
        assert_eq!(ctx.results().count(), 2);
    }

    #[tokio::test]
    async fn test_running_operation_means_wait() {
        let mut ctx = ExecutionContext::new("A");
        ctx.add_operation(op(2)).unwrap();
        ctx.add_operation(op(3)).unwrap();

        assert_eq!(status(&mut ctx).await, ContextStatus::Wait);
        assert_eq!(ctx.outstanding(), 1);
        assert_eq!(ctx.wait().polls, 1);
        assert_eq!(ctx.wait().started_at, Some(2000));
    }

    #[tokio::test]
    async fn test_force_failed_and_successful_is_fail() {
        let mut ctx = ExecutionContext::new("A");
        let mut failed = op(3);
        failed.apply_force_fail("operator abort", 1500);
        ctx.add_operation(failed).unwrap();
        ctx.add_operation(op(2)).unwrap();

        assert_eq!(status(&mut ctx).await, ContextStatus::Fail);
    }

    #[tokio::test]
    async fn test_fail_wins_over_wait() {
        let mut ctx = ExecutionContext::new("A");
        let mut result = OperationResult::new();
        result.set_id(OperationId::task("child")).unwrap();
        result.set_exit_code(2).unwrap();
        ctx.add_result(result).unwrap();
        ctx.add_operation(op(5)).unwrap();

        assert_eq!(status(&mut ctx).await, ContextStatus::Fail);
    }

    #[tokio::test]
    async fn test_signal_processed_once() {
        let mut ctx = ExecutionContext::new("A");
        ctx.add_operation(op(41)).unwrap();
        let mut queue = SignalQueue::new();

        let signal = Signal::completion("task-1", OperationId::remote("server1", 41, 1000), 0, 1200);
        queue.enqueue(signal.clone());
        assert_eq!(ctx.process_signals(&mut queue), 1);

        // Redelivery of the consumed signal is refused by the queue
        queue.enqueue(signal);
        assert_eq!(ctx.process_signals(&mut queue), 0);

        // A distinct signal for the same operation never replaces the result
        queue.enqueue(Signal::completion(
            "task-1",
            OperationId::remote("server1", 41, 1000),
            7,
            1300,
        ));
        assert_eq!(ctx.process_signals(&mut queue), 0);
        assert!(queue.is_empty());

        assert_eq!(status(&mut ctx).await, ContextStatus::Success);
    }

    #[test]
    fn test_set_operation_replaces() {
        let mut ctx = ExecutionContext::new("A");
        ctx.add_operation(op(1)).unwrap();
        ctx.add_operation(op(3)).unwrap();
        ctx.set_operation(op(5)).unwrap();

        let ids: Vec<String> = ctx.tracked_ids().map(|id| id.to_string()).collect();
        assert_eq!(ids, vec!["server1:5@1000"]);

        assert!(ctx.add_operation(op(5)).is_err());
        // Operations without an id are refused before anything is cleared
        assert!(ctx.set_operation(Operation::new("parity", "no id")).is_err());
        assert_eq!(ctx.outstanding(), 1);
    }

    #[test]
    fn test_typed_values() {
        let mut ctx = ExecutionContext::new("A");
        ctx.set_value("rows", &42u64).unwrap();
        assert_eq!(ctx.value::<u64>("rows").unwrap(), Some(42));
        assert_eq!(ctx.value::<u64>("missing").unwrap(), None);
        assert!(ctx.value::<String>("rows").is_err());
        assert!(ctx.remove_value("rows").is_some());
        assert!(!ctx.has_value("rows"));
    }

    #[test]
    fn test_links_share_storage() {
        let mut store = ContextStore::new();
        store.get_mut("check").unwrap().add_operation(op(1)).unwrap();
        store.link("recheck", "check").unwrap();

        assert_eq!(store.get("recheck").unwrap().outstanding(), 1);
        store.get_mut("recheck").unwrap().add_operation(op(3)).unwrap();
        assert_eq!(store.get("check").unwrap().outstanding(), 2);
        assert_eq!(store.resolve("recheck").unwrap(), "check");
    }

    #[test]
    fn test_link_cycles_rejected() {
        let mut store = ContextStore::new();
        store.link("a", "b").unwrap();
        store.link("b", "c").unwrap();
        assert!(store.link("c", "a").is_err());
        assert!(store.link("a", "a").is_err());
    }

    #[test]
    fn test_store_round_trips_through_json() {
        let mut store = ContextStore::new();
        store.get_mut("A").unwrap().add_operation(op(1)).unwrap();
        store.link("B", "A").unwrap();

        let json = serde_json::to_string(&store).unwrap();
        let back: ContextStore = serde_json::from_str(&json).unwrap();
        assert_eq!(back, store);
    }
}
