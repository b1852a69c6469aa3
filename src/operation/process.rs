// ABOUTME: Generic model of one externally executing unit of work
// ABOUTME: Holds write-once identity, timing and exit fields plus the attached result

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, trace};

use super::error::{OperationError, Result};
use super::fields::{validate_timestamp, Timestamp, WriteOnce};
use super::id::OperationId;
use super::result::OperationResult;
use super::FORCE_FAILED_EXIT_CODE;

/// Samples of a monotonically growing progress proxy across wake-ups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressTracker {
    pub last_sample: Option<u64>,
    pub unchanged_wakeups: u32,
    #[serde(default)]
    pub last_sampled_at: Option<Timestamp>,
}

impl ProgressTracker {
    /// Records a sample and returns how many consecutive wake-ups showed no growth.
    ///
    /// A shrinking value counts as no progress; truncated or rotated output is
    /// not taken as evidence of a restart. Only the first sample taken at a
    /// given `now` counts.
    pub fn record(&mut self, sample: u64, now: Timestamp) -> u32 {
        if self.last_sampled_at == Some(now) {
            return self.unchanged_wakeups;
        }
        self.last_sampled_at = Some(now);
        match self.last_sample {
            Some(previous) if sample <= previous => self.unchanged_wakeups += 1,
            _ => self.unchanged_wakeups = 0,
        }
        self.last_sample = Some(sample);
        self.unchanged_wakeups
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Registry key of the backend that can probe this operation.
    backend: String,
    description: String,
    id: WriteOnce<OperationId>,
    owner_id: WriteOnce<String>,
    start_time: WriteOnce<Timestamp>,
    end_time: WriteOnce<Timestamp>,
    exit_code: WriteOnce<i32>,
    success_codes: BTreeSet<i32>,
    exit_message: WriteOnce<String>,
    result: Option<OperationResult>,
    #[serde(default)]
    missing_signal_failure_time: Option<Timestamp>,
    #[serde(default)]
    progress: ProgressTracker,
}

impl Operation {
    pub fn new(backend: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            description: description.into(),
            id: WriteOnce::new(),
            owner_id: WriteOnce::new(),
            start_time: WriteOnce::new(),
            end_time: WriteOnce::new(),
            exit_code: WriteOnce::new(),
            success_codes: BTreeSet::from([0]),
            exit_message: WriteOnce::new(),
            result: None,
            missing_signal_failure_time: None,
            progress: ProgressTracker::default(),
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    pub fn id(&self) -> Result<&OperationId> {
        self.id.get("id")
    }

    pub fn set_id(&mut self, id: OperationId) -> Result<()> {
        self.id.set("id", id)
    }

    pub fn owner_id(&self) -> Result<&str> {
        self.owner_id.get("owner_id").map(String::as_str)
    }

    pub fn set_owner_id(&mut self, owner_id: impl Into<String>) -> Result<()> {
        let owner_id = owner_id.into();
        if owner_id.trim().is_empty() {
            return Err(OperationError::invalid("owner_id", "owner id cannot be empty"));
        }
        self.owner_id.set("owner_id", owner_id)
    }

    pub fn start_time(&self) -> Result<Timestamp> {
        self.start_time.value("start_time")
    }

    pub fn set_start_time(&mut self, start_time: Timestamp) -> Result<()> {
        validate_timestamp("start_time", start_time)?;
        self.start_time.set("start_time", start_time)
    }

    pub fn end_time(&self) -> Result<Timestamp> {
        self.end_time.value("end_time")
    }

    pub fn set_end_time(&mut self, end_time: Timestamp) -> Result<()> {
        validate_timestamp("end_time", end_time)?;
        // Completion is only measurable against a known start
        let start = self.start_time()?;
        if end_time < start {
            return Err(OperationError::invalid(
                "end_time",
                format!("end time {} precedes start time {}", end_time, start),
            ));
        }
        self.end_time.set("end_time", end_time)
    }

    pub fn exit_code(&self) -> Result<i32> {
        self.exit_code.value("exit_code")
    }

    pub fn set_exit_code(&mut self, exit_code: i32) -> Result<()> {
        self.exit_code.set("exit_code", exit_code)
    }

    pub fn success_codes(&self) -> &BTreeSet<i32> {
        &self.success_codes
    }

    pub fn set_success_codes(&mut self, codes: impl IntoIterator<Item = i32>) -> Result<()> {
        let codes: BTreeSet<i32> = codes.into_iter().collect();
        if codes.is_empty() {
            return Err(OperationError::invalid(
                "success_codes",
                "at least one success code is required",
            ));
        }
        self.success_codes = codes;
        Ok(())
    }

    pub fn exit_message(&self) -> Result<&str> {
        self.exit_message.get("exit_message").map(String::as_str)
    }

    pub fn set_exit_message(&mut self, message: impl Into<String>) -> Result<()> {
        self.exit_message.set("exit_message", message.into())
    }

    pub fn result(&self) -> Option<&OperationResult> {
        self.result.as_ref()
    }

    /// Attaches the outcome. An already attached result is never replaced.
    ///
    /// Returns `true` when the result was stored.
    pub fn attach_result(&mut self, mut result: OperationResult) -> bool {
        if self.result.is_some() {
            return false;
        }
        // The operation owns the success contract
        result.adopt_success_codes(&self.success_codes);
        self.populate_from_result(&result);
        self.result = Some(result);
        true
    }

    /// Default completion check: done once a result is cached.
    pub fn has_completed(&self) -> bool {
        self.result.is_some()
    }

    /// Outcome judged against the success set; `None` while still running.
    pub fn succeeded(&self) -> Option<bool> {
        self.result.as_ref().map(OperationResult::is_successful)
    }

    pub fn missing_signal_failure_time(&self) -> Option<Timestamp> {
        self.missing_signal_failure_time
    }

    /// Records when the backend first had no information about this operation.
    ///
    /// Later calls keep the first timestamp so the bound cannot slide.
    pub fn set_missing_signal_failure_time(&mut self, at: Timestamp) -> Result<()> {
        validate_timestamp("missing_signal_failure_time", at)?;
        if self.missing_signal_failure_time.is_none() {
            self.missing_signal_failure_time = Some(at);
        }
        Ok(())
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub(crate) fn progress_mut(&mut self) -> &mut ProgressTracker {
        &mut self.progress
    }

    /// Best-effort copy of overlapping fields from a result.
    ///
    /// Optional fields that are unset on the result are skipped. Identity and
    /// exit code fields are copied when present; a conflict is logged and the
    /// value already held by the operation is kept.
    pub fn populate_from_result(&mut self, result: &OperationResult) {
        let copies = [
            ("id", self.id.merge_from("id", result.id_cell())),
            (
                "owner_id",
                self.owner_id.merge_from("owner_id", result.owner_id_cell()),
            ),
            (
                "start_time",
                self.start_time
                    .merge_from("start_time", result.start_time_cell()),
            ),
            (
                "end_time",
                self.end_time.merge_from("end_time", result.end_time_cell()),
            ),
            (
                "exit_code",
                self.exit_code.merge_from("exit_code", result.exit_code_cell()),
            ),
            (
                "exit_message",
                self.exit_message
                    .merge_from("exit_message", result.exit_message_cell()),
            ),
        ];

        for (field, outcome) in copies {
            match outcome {
                Ok(()) | Err(OperationError::NotYetAvailable { .. }) => {}
                Err(e) if matches!(field, "id" | "exit_code") => {
                    debug!("Keeping existing {} on operation: {}", field, e);
                }
                Err(e) => trace!("Skipped {} while populating operation: {}", field, e),
            }
        }
    }

    /// Terminal override: sentinel exit code and `reason`, ignoring write-once guards.
    ///
    /// The backend kill attempt happens in the correlator before this is applied.
    pub(crate) fn apply_force_fail(&mut self, reason: &str, now: Timestamp) {
        self.exit_code.overwrite(FORCE_FAILED_EXIT_CODE);
        self.exit_message.overwrite(reason.to_string());
        if !self.end_time.is_set() && self.start_time.as_option().is_some_and(|s| *s <= now) {
            self.end_time.overwrite(now);
        }

        if let Some(result) = self.result.as_mut() {
            result.force_fail(reason);
            return;
        }
        let mut result = OperationResult::for_operation(self);
        result.force_fail(reason);
        self.result = Some(result);
    }

    pub(crate) fn id_cell(&self) -> &WriteOnce<OperationId> {
        &self.id
    }

    pub(crate) fn owner_id_cell(&self) -> &WriteOnce<String> {
        &self.owner_id
    }

    pub(crate) fn start_time_cell(&self) -> &WriteOnce<Timestamp> {
        &self.start_time
    }

    pub(crate) fn end_time_cell(&self) -> &WriteOnce<Timestamp> {
        &self.end_time
    }

    pub(crate) fn exit_code_cell(&self) -> &WriteOnce<i32> {
        &self.exit_code
    }

    pub(crate) fn exit_message_cell(&self) -> &WriteOnce<String> {
        &self.exit_message
    }
}
