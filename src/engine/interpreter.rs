// ABOUTME: Task interpreter that advances a task one state transition per call
// ABOUTME: Drains signals, runs state logic, looks up the table and records every transition

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use super::clock::StepTimer;
use super::context::{ContextStore, ExecutionContext};
use super::error::{EngineError, Result};
use super::recording::Recording;
use super::result::{StepOutcome, StepStatus};
use super::runtime::Runtime;
use super::state::StepContext;
use super::table::{Destination, Terminal, TransitionTable, DEFAULT_TRANSITION};
use crate::operation::Timestamp;
use crate::scheduling::{TaskMetadata, TaskStatus};
use crate::signal::SignalQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterPhase {
    Ready,
    Running,
    WaitingForSignal,
    BetweenTransitions,
    Complete,
    Terminated,
    Failed,
}

impl InterpreterPhase {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            InterpreterPhase::Complete | InterpreterPhase::Terminated | InterpreterPhase::Failed
        )
    }
}

impl std::fmt::Display for InterpreterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InterpreterPhase::Ready => write!(f, "ready"),
            InterpreterPhase::Running => write!(f, "running"),
            InterpreterPhase::WaitingForSignal => write!(f, "waiting_for_signal"),
            InterpreterPhase::BetweenTransitions => write!(f, "between_transitions"),
            InterpreterPhase::Complete => write!(f, "complete"),
            InterpreterPhase::Terminated => write!(f, "terminated"),
            InterpreterPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Drives one task through its transition table.
///
/// Everything here is plain data so a task can be snapshotted between steps
/// and resumed by another worker.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInterpreter {
    pub(crate) task_id: String,
    pub(crate) table_text: String,
    pub(crate) table: TransitionTable,
    pub(crate) current_state: String,
    pub(crate) phase: InterpreterPhase,
    pub(crate) finished: Option<Terminal>,
    pub(crate) final_message: Option<String>,
    pub(crate) contexts: ContextStore,
    pub(crate) signals: SignalQueue,
    pub(crate) timer: StepTimer,
    pub(crate) recordings: Vec<Recording>,
    /// Traversal counts per transition value for the current state only.
    pub(crate) attempts: BTreeMap<String, u32>,
    pub(crate) transient_failures: u32,
    pub(crate) metadata: TaskMetadata,
}

impl TaskInterpreter {
    /// Compiles `table_text` and checks that every state has registered logic.
    pub fn new(task_id: impl Into<String>, table_text: &str, runtime: &Runtime) -> Result<Self> {
        let task_id = task_id.into();
        let table = TransitionTable::compile(table_text)?;
        for warning in table.warnings() {
            warn!("Task {}: {}", task_id, warning);
        }
        validate_handlers(&table, runtime)?;

        let now = runtime.now();
        let metadata = TaskMetadata::new(task_id.clone(), now);
        let mut recordings = Vec::new();
        if runtime.config().record_transitions {
            recordings.push(Recording::new(metadata.run(), now));
        }

        let mut contexts = ContextStore::new();
        contexts.get_mut(table.start_state())?;

        debug!(
            "Created task {} with {} states starting at '{}'",
            task_id,
            table.states().count(),
            table.start_state()
        );

        Ok(Self {
            current_state: table.start_state().to_string(),
            task_id,
            table_text: table_text.to_string(),
            table,
            phase: InterpreterPhase::Ready,
            finished: None,
            final_message: None,
            contexts,
            signals: SignalQueue::new(),
            timer: StepTimer::new(now),
            recordings,
            attempts: BTreeMap::new(),
            transient_failures: 0,
            metadata,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    pub fn table_text(&self) -> &str {
        &self.table_text
    }

    pub fn current_state(&self) -> &str {
        &self.current_state
    }

    pub fn phase(&self) -> InterpreterPhase {
        self.phase
    }

    pub fn is_finished(&self) -> bool {
        self.phase.is_finished()
    }

    pub fn exit_message(&self) -> Option<&str> {
        self.final_message.as_deref()
    }

    pub fn contexts(&self) -> &ContextStore {
        &self.contexts
    }

    pub fn context(&self, name: &str) -> Option<&ExecutionContext> {
        self.contexts.get(name)
    }

    /// Mutable access for seeding contexts before the first step.
    pub fn context_mut(&mut self, name: &str) -> Result<&mut ExecutionContext> {
        self.contexts.get_mut(name)
    }

    pub fn signals(&self) -> &SignalQueue {
        &self.signals
    }

    pub fn timer(&self) -> &StepTimer {
        &self.timer
    }

    pub fn recordings(&self) -> &[Recording] {
        &self.recordings
    }

    pub fn metadata(&self) -> &TaskMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut TaskMetadata {
        &mut self.metadata
    }

    pub fn attempts(&self, value: &str) -> u32 {
        self.attempts.get(value).copied().unwrap_or(0)
    }

    /// Runs the current state's logic once and applies the resulting transition.
    ///
    /// Calling this on a finished task returns the final outcome again.
    #[instrument(skip(self, runtime), fields(task_id = %self.task_id, state = %self.current_state))]
    pub async fn move_to_next_state(&mut self, runtime: &Runtime) -> Result<StepOutcome> {
        if self.phase.is_finished() {
            return Ok(self.finished_outcome());
        }

        let now = runtime.now();
        let state = self.current_state.clone();
        let resume_phase = self.phase;
        let resume_status = (self.metadata.status(), self.metadata.updated_at);
        self.phase = InterpreterPhase::Running;
        self.note_status(TaskStatus::Processing, now);

        let signals_processed = self.drain_signals(runtime, &state, now).await?;

        let Some(handler) = runtime.states().get(&state) else {
            let message = EngineError::MissingHandler {
                state: state.clone(),
            }
            .to_string();
            error!("{}", message);
            return self.finish(Terminal::SystemError, &state, None, message, now, signals_processed);
        };

        let decision = {
            let mut step = StepContext::new(
                &self.task_id,
                &state,
                now,
                &mut self.contexts,
                &self.metadata,
                runtime,
            );
            handler.run(&mut step).await
        };

        let value = match decision {
            Ok(value) => {
                self.transient_failures = 0;
                value
            }
            Err(e) if e.is_transient() => {
                return self.retry_transient(runtime, &state, e, now, signals_processed);
            }
            Err(e) if e.is_contract_violation() => {
                error!("State '{}' violated an operation contract: {}", state, e);
                self.phase = resume_phase;
                let (status, updated_at) = resume_status;
                self.metadata.set_status(status, updated_at);
                return Err(e);
            }
            Err(e) => {
                error!("State '{}' failed: {}", state, e);
                return self.finish(
                    Terminal::SystemError,
                    &state,
                    None,
                    e.to_string(),
                    now,
                    signals_processed,
                );
            }
        };

        let transition = match self.table.lookup(&state, &value) {
            Ok(transition) => transition.clone(),
            Err(e) => {
                error!("{}", e);
                return self.finish(
                    Terminal::SystemError,
                    &state,
                    Some(value.as_str()),
                    e.to_string(),
                    now,
                    signals_processed,
                );
            }
        };

        let attempts = {
            let count = self.attempts.entry(value.clone()).or_insert(0);
            *count += 1;
            *count
        };
        if transition.max_attempts > 0 && attempts > transition.max_attempts {
            let message = format!(
                "State '{}' exceeded the limit of {} attempts for transition '{}'",
                state,
                transition.max_attempts,
                display_value(&value)
            );
            warn!("{}", message);
            return self.finish(
                Terminal::SystemError,
                &state,
                Some(value.as_str()),
                message,
                now,
                signals_processed,
            );
        }

        if runtime.config().record_transitions {
            self.record(&state, &value, &transition.destination.to_string(), now);
        }

        let wait = transition.wait();
        match transition.destination {
            Destination::Terminal(terminal) => {
                let message = self
                    .contexts
                    .get(&state)
                    .and_then(ExecutionContext::exit_message)
                    .map(str::to_string)
                    .unwrap_or_else(|| {
                        format!(
                            "Finished in state '{}' via '{}' with {}",
                            state,
                            display_value(&value),
                            terminal
                        )
                    });
                self.finish(terminal, &state, Some(value.as_str()), message, now, signals_processed)
            }
            Destination::State(next) => {
                let looping = next == state;
                let delay = if !wait.is_zero() {
                    wait
                } else if looping {
                    runtime.config().default_poll_delay
                } else {
                    Duration::ZERO
                };

                if !looping {
                    self.attempts.clear();
                    self.contexts.get_mut(&next)?;
                }

                self.phase = if looping {
                    InterpreterPhase::WaitingForSignal
                } else {
                    InterpreterPhase::BetweenTransitions
                };
                self.current_state = next.clone();

                let outcome = StepOutcome {
                    task_id: self.task_id.clone(),
                    from_state: state.clone(),
                    state: next,
                    transition_value: Some(value),
                    delay,
                    complete: false,
                    status: StepStatus::Ok,
                    exit_message: None,
                    signals_processed,
                };
                self.schedule(&outcome, now);

                debug!(
                    "Task {} moved '{}' -> '{}' (wait {}s)",
                    self.task_id,
                    outcome.from_state,
                    outcome.state,
                    delay.as_secs()
                );
                Ok(outcome)
            }
        }
    }

    /// Starts a new run from the start state. Earlier recordings and run history are kept.
    pub fn restart(&mut self, runtime: &Runtime) {
        let now = runtime.now();
        self.metadata.begin_rerun(now);
        info!(
            "Task {} restarted (run {})",
            self.task_id,
            self.metadata.run()
        );

        self.current_state = self.table.start_state().to_string();
        self.phase = InterpreterPhase::Ready;
        self.finished = None;
        self.final_message = None;
        self.attempts.clear();
        self.transient_failures = 0;
        self.contexts.reset_wait_bookkeeping();
        self.timer.next_wake_at = None;
        self.metadata.wake_at = None;

        if runtime.config().record_transitions {
            self.recordings.push(Recording::new(self.metadata.run(), now));
        }
    }

    async fn drain_signals(&mut self, runtime: &Runtime, state: &str, now: Timestamp) -> Result<usize> {
        let transport = runtime.transport();

        match transport.pending_for_owner(&self.task_id).await {
            Ok(signals) => {
                for signal in signals {
                    self.signals.enqueue(signal);
                }
            }
            Err(e) => warn!("Signal transport unavailable, relying on polling: {}", e),
        }

        let processed = self.contexts.get_mut(state)?.process_signals(&mut self.signals);

        for signal_id in self.signals.take_acks() {
            if let Err(e) = transport.mark_consumed(signal_id).await {
                warn!("Failed to acknowledge signal {}: {}", signal_id, e);
                self.signals.requeue_ack(signal_id);
                continue;
            }
            if let Err(e) = transport.delete(signal_id).await {
                debug!("Acknowledged signal {} stays in the transport: {}", signal_id, e);
            }
        }

        let retention = runtime.config().signal_retention;
        let pruned = self.signals.prune_consumed(now, retention);
        if pruned > 0 {
            debug!("Forgot {} consumed signal ids past retention", pruned);
        }

        let tracked = self.contexts.tracked_ids();
        let stale: Vec<_> = self
            .signals
            .expired(now, retention)
            .into_iter()
            .filter(|id| {
                self.signals
                    .pending()
                    .any(|s| s.signal_id == *id && !tracked.contains(&s.operation_id))
            })
            .collect();
        for signal_id in stale {
            self.signals.take(signal_id);
            match transport.delete(signal_id).await {
                Ok(_) => debug!("Deleted unmatched signal {}", signal_id),
                Err(e) => warn!("Failed to delete unmatched signal {}: {}", signal_id, e),
            }
        }

        Ok(processed)
    }

    fn retry_transient(
        &mut self,
        runtime: &Runtime,
        state: &str,
        cause: EngineError,
        now: Timestamp,
        signals_processed: usize,
    ) -> Result<StepOutcome> {
        self.transient_failures += 1;
        let limit = runtime.config().transient_retry_limit;
        if self.transient_failures > limit {
            let message = format!(
                "State '{}' gave up after {} transient failures: {}",
                state, self.transient_failures, cause
            );
            warn!("{}", message);
            return self.finish(Terminal::SystemError, state, None, message, now, signals_processed);
        }

        warn!(
            "Transient failure {}/{} in state '{}': {}",
            self.transient_failures, limit, state, cause
        );
        self.phase = InterpreterPhase::WaitingForSignal;
        let outcome = StepOutcome {
            task_id: self.task_id.clone(),
            from_state: state.to_string(),
            state: state.to_string(),
            transition_value: None,
            delay: runtime.config().transient_retry_delay,
            complete: false,
            status: StepStatus::Ok,
            exit_message: Some(cause.to_string()),
            signals_processed,
        };
        self.schedule(&outcome, now);
        Ok(outcome)
    }

    fn finish(
        &mut self,
        terminal: Terminal,
        state: &str,
        value: Option<&str>,
        message: String,
        now: Timestamp,
        signals_processed: usize,
    ) -> Result<StepOutcome> {
        let status = terminal.step_status();
        self.metadata.set_exit_status(status.exit_status(), now)?;
        self.note_status(TaskStatus::Complete, now);
        self.metadata.wake_at = None;
        self.timer.record_step(now, None);

        self.phase = match terminal {
            Terminal::Complete | Terminal::Warning => InterpreterPhase::Complete,
            Terminal::Terminated => InterpreterPhase::Terminated,
            Terminal::UserError | Terminal::SystemError => InterpreterPhase::Failed,
        };
        self.finished = Some(terminal);
        self.final_message = Some(message.clone());

        match status {
            StepStatus::Ok => info!("Task {} completed: {}", self.task_id, message),
            _ => warn!("Task {} finished with {}: {}", self.task_id, status, message),
        }

        Ok(StepOutcome {
            task_id: self.task_id.clone(),
            from_state: state.to_string(),
            state: state.to_string(),
            transition_value: value.map(str::to_string),
            delay: Duration::ZERO,
            complete: true,
            status,
            exit_message: Some(message),
            signals_processed,
        })
    }

    fn finished_outcome(&self) -> StepOutcome {
        StepOutcome {
            task_id: self.task_id.clone(),
            from_state: self.current_state.clone(),
            state: self.current_state.clone(),
            transition_value: None,
            delay: Duration::ZERO,
            complete: true,
            status: self
                .finished
                .map_or(StepStatus::SystemError, |t| t.step_status()),
            exit_message: self.final_message.clone(),
            signals_processed: 0,
        }
    }

    fn schedule(&mut self, outcome: &StepOutcome, now: Timestamp) {
        let wake_at = outcome.wake_at(now);
        self.metadata.wake_at = Some(wake_at);
        self.timer.record_step(now, Some(wake_at));
        let status = if outcome.delay.is_zero() {
            TaskStatus::Processing
        } else {
            TaskStatus::Waiting
        };
        self.note_status(status, now);
    }

    fn record(&mut self, state: &str, value: &str, next: &str, now: Timestamp) {
        let run = self.metadata.run();
        if self.recordings.last().map_or(true, |r| r.run != run) {
            self.recordings.push(Recording::new(run, now));
        }
        if let Some(recording) = self.recordings.last_mut() {
            recording.push(state, value, next, now);
        }
    }

    fn note_status(&mut self, status: TaskStatus, now: Timestamp) {
        if self.metadata.set_status(status, now) {
            info!("Task {} is now {}", self.task_id, status);
        }
    }
}

pub(crate) fn validate_handlers(table: &TransitionTable, runtime: &Runtime) -> Result<()> {
    for state in table.states() {
        if !runtime.states().contains(state) {
            return Err(EngineError::MissingHandler {
                state: state.to_string(),
            });
        }
    }
    Ok(())
}

fn display_value(value: &str) -> &str {
    if value.is_empty() {
        DEFAULT_TRANSITION
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::clock::ManualClock;
    use crate::engine::state::StateRegistry;
    use crate::scheduling::ExitStatus;
    use std::sync::Arc;

    const TABLE: &str = "\
        start  go    work   0  0\n\
        work   wait  work   5  3\n\
        work   done  @complete 0 0\n";

    fn runtime(states: StateRegistry) -> (Runtime, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let runtime = Runtime::new(states, EngineConfig::default()).with_clock(clock.clone());
        (runtime, clock)
    }

    fn counting_states() -> StateRegistry {
        StateRegistry::new()
            .with_fn("start", |_| Ok("go".to_string()))
            .with_fn("work", |step| {
                let ctx = step.context()?;
                let polls: u32 = ctx.value("polls")?.unwrap_or(0);
                ctx.set_value("polls", &(polls + 1))?;
                Ok(if polls >= 1 { "done" } else { "wait" }.to_string())
            })
    }

    #[test]
    fn test_missing_handler_rejected() {
        let states = StateRegistry::new().with_fn("start", |_| Ok("go".to_string()));
        let (runtime, _) = runtime(states);
        let err = TaskInterpreter::new("t1", TABLE, &runtime).unwrap_err();
        assert!(matches!(err, EngineError::MissingHandler { ref state } if state == "work"));
    }

    #[tokio::test]
    async fn test_runs_to_completion() {
        let (runtime, clock) = runtime(counting_states());
        let mut task = TaskInterpreter::new("t1", TABLE, &runtime).unwrap();
        assert_eq!(task.phase(), InterpreterPhase::Ready);

        let first = task.move_to_next_state(&runtime).await.unwrap();
        assert_eq!(first.state, "work");
        assert_eq!(first.delay, Duration::ZERO);
        assert_eq!(task.phase(), InterpreterPhase::BetweenTransitions);

        let second = task.move_to_next_state(&runtime).await.unwrap();
        assert_eq!(second.state, "work");
        assert_eq!(second.delay, Duration::from_secs(5));
        assert_eq!(task.phase(), InterpreterPhase::WaitingForSignal);
        assert_eq!(task.metadata().wake_at, Some(1_005));

        clock.advance(5);
        let last = task.move_to_next_state(&runtime).await.unwrap();
        assert!(last.complete);
        assert_eq!(last.status, StepStatus::Ok);
        assert_eq!(task.metadata().exit_status(), ExitStatus::Completed);
        assert_eq!(task.metadata().status(), TaskStatus::Complete);
        assert_eq!(task.recordings()[0].len(), 3);

        let again = task.move_to_next_state(&runtime).await.unwrap();
        assert!(again.complete);
        assert_eq!(again.exit_message, last.exit_message);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let states = StateRegistry::new()
            .with_fn("start", |_| Ok("go".to_string()))
            .with_fn("work", |_| Ok("wait".to_string()));
        let (runtime, _) = runtime(states);
        let mut task = TaskInterpreter::new("t1", TABLE, &runtime).unwrap();

        let mut outcome = task.move_to_next_state(&runtime).await.unwrap();
        while !outcome.complete {
            outcome = task.move_to_next_state(&runtime).await.unwrap();
        }
        assert_eq!(outcome.status, StepStatus::SystemError);
        let message = outcome.exit_message.unwrap();
        assert!(message.contains("work"));
        assert!(message.contains("wait"));
        assert!(message.contains('3'));
        assert_eq!(task.phase(), InterpreterPhase::Failed);
    }

    #[tokio::test]
    async fn test_restart_begins_new_run() {
        let (runtime, _) = runtime(counting_states());
        let mut task = TaskInterpreter::new("t1", TABLE, &runtime).unwrap();
        while !task.move_to_next_state(&runtime).await.unwrap().complete {}

        task.restart(&runtime);
        assert_eq!(task.current_state(), "start");
        assert_eq!(task.phase(), InterpreterPhase::Ready);
        assert_eq!(task.metadata().run(), 2);
        assert_eq!(task.metadata().exit_status(), ExitStatus::NotFinished);
        assert_eq!(task.recordings().len(), 2);
        assert_eq!(task.metadata().history().len(), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(InterpreterPhase::WaitingForSignal.to_string(), "waiting_for_signal");
        assert!(InterpreterPhase::Terminated.is_finished());
        assert!(!InterpreterPhase::BetweenTransitions.is_finished());
    }
}
