// ABOUTME: Serializable snapshot of a task interpreter between steps
// ABOUTME: Lets another worker resume a task from JSON text or a file on disk

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use super::clock::StepTimer;
use super::context::ContextStore;
use super::error::{EngineError, Result};
use super::interpreter::{validate_handlers, InterpreterPhase, TaskInterpreter};
use super::recording::Recording;
use super::runtime::Runtime;
use super::table::{Terminal, TransitionTable};
use crate::scheduling::TaskMetadata;
use crate::signal::SignalQueue;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub version: u32,
    pub task_id: String,
    /// The table is stored as text and recompiled on restore.
    pub table_text: String,
    pub current_state: String,
    pub phase: InterpreterPhase,
    pub finished: Option<Terminal>,
    pub final_message: Option<String>,
    pub contexts: ContextStore,
    pub signals: SignalQueue,
    pub timer: StepTimer,
    pub recordings: Vec<Recording>,
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub transient_failures: u32,
    pub metadata: TaskMetadata,
}

impl TaskSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Writes through a sibling temp file so a crash never leaves a torn snapshot.
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!("Saved snapshot of task {} to {}", self.task_id, path.display());
        Ok(())
    }

    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }
}

impl TaskInterpreter {
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            version: SNAPSHOT_VERSION,
            task_id: self.task_id.clone(),
            table_text: self.table_text.clone(),
            current_state: self.current_state.clone(),
            phase: self.phase,
            finished: self.finished,
            final_message: self.final_message.clone(),
            contexts: self.contexts.clone(),
            signals: self.signals.clone(),
            timer: self.timer.clone(),
            recordings: self.recordings.clone(),
            attempts: self.attempts.clone(),
            transient_failures: self.transient_failures,
            metadata: self.metadata.clone(),
        }
    }

    /// Rebuilds an interpreter; unfinished tasks must still have logic for every state.
    pub fn restore(snapshot: TaskSnapshot, runtime: &Runtime) -> Result<Self> {
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(EngineError::Configuration(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }

        let table = TransitionTable::compile(&snapshot.table_text)?;
        if !table.has_state(&snapshot.current_state) {
            return Err(EngineError::UnknownState {
                state: snapshot.current_state,
            });
        }
        if !snapshot.phase.is_finished() {
            validate_handlers(&table, runtime)?;
        }

        Ok(Self {
            task_id: snapshot.task_id,
            table_text: snapshot.table_text,
            table,
            current_state: snapshot.current_state,
            phase: snapshot.phase,
            finished: snapshot.finished,
            final_message: snapshot.final_message,
            contexts: snapshot.contexts,
            signals: snapshot.signals,
            timer: snapshot.timer,
            recordings: snapshot.recordings,
            attempts: snapshot.attempts,
            transient_failures: snapshot.transient_failures,
            metadata: snapshot.metadata,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        self.snapshot().to_json()
    }

    pub fn from_json(json: &str, runtime: &Runtime) -> Result<Self> {
        Self::restore(TaskSnapshot::from_json(json)?, runtime)
    }

    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        self.snapshot().save_to_file(path).await
    }

    pub async fn load_from_file(path: &Path, runtime: &Runtime) -> Result<Self> {
        Self::restore(TaskSnapshot::load_from_file(path).await?, runtime)
    }
}
