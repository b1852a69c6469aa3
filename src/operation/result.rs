// ABOUTME: Outcome snapshot of a finished operation
// ABOUTME: Mirrors operation fields plus payload and supports unconditional force-fail

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::trace;

use super::error::Result;
use super::fields::{validate_timestamp, Timestamp, WriteOnce};
use super::id::OperationId;
use super::process::Operation;
use super::FORCE_FAILED_EXIT_CODE;

/// Concrete data captured from the backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResultPayload {
    #[default]
    Empty,
    Output {
        stdout: String,
        stderr: String,
    },
    Json(serde_json::Value),
}

impl ResultPayload {
    pub fn stdout(&self) -> Option<&str> {
        match self {
            ResultPayload::Output { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    id: WriteOnce<OperationId>,
    owner_id: WriteOnce<String>,
    start_time: WriteOnce<Timestamp>,
    end_time: WriteOnce<Timestamp>,
    exit_code: WriteOnce<i32>,
    success_codes: BTreeSet<i32>,
    exit_message: WriteOnce<String>,
    #[serde(default)]
    payload: ResultPayload,
    #[serde(default)]
    forced: bool,
}

impl Default for OperationResult {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationResult {
    pub fn new() -> Self {
        Self {
            id: WriteOnce::new(),
            owner_id: WriteOnce::new(),
            start_time: WriteOnce::new(),
            end_time: WriteOnce::new(),
            exit_code: WriteOnce::new(),
            success_codes: BTreeSet::from([0]),
            exit_message: WriteOnce::new(),
            payload: ResultPayload::Empty,
            forced: false,
        }
    }

    /// Result skeleton carrying the identity and outcome fields of `operation`.
    pub fn for_operation(operation: &Operation) -> Self {
        let mut result = Self::new();
        result.populate_from_process(operation);
        result
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
        self.owner_id.set("owner_id", owner_id.into())
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
            return Err(super::OperationError::invalid(
                "success_codes",
                "at least one success code is required",
            ));
        }
        self.success_codes = codes;
        Ok(())
    }

    pub(crate) fn adopt_success_codes(&mut self, codes: &BTreeSet<i32>) {
        if !codes.is_empty() {
            self.success_codes = codes.clone();
        }
    }

    pub fn exit_message(&self) -> Result<&str> {
        self.exit_message.get("exit_message").map(String::as_str)
    }

    pub fn set_exit_message(&mut self, message: impl Into<String>) -> Result<()> {
        self.exit_message.set("exit_message", message.into())
    }

    pub fn payload(&self) -> &ResultPayload {
        &self.payload
    }

    pub fn set_payload(&mut self, payload: ResultPayload) {
        self.payload = payload;
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    /// True only when an exit code is present and belongs to the success set.
    pub fn is_successful(&self) -> bool {
        !self.forced
            && self
                .exit_code
                .as_option()
                .is_some_and(|code| self.success_codes.contains(code))
    }

    /// Unconditionally marks this result failed with the reserved sentinel.
    pub fn force_fail(&mut self, reason: impl Into<String>) {
        self.exit_code.overwrite(FORCE_FAILED_EXIT_CODE);
        self.exit_message.overwrite(reason.into());
        self.forced = true;
    }

    /// Best-effort copy of overlapping fields from the owning operation.
    ///
    /// Fields missing on the operation are skipped; a conflicting value never
    /// replaces what this result already holds.
    pub fn populate_from_process(&mut self, operation: &Operation) {
        self.success_codes = operation.success_codes().clone();

        let copies = [
            ("id", self.id.merge_from("id", operation.id_cell())),
            (
                "owner_id",
                self.owner_id.merge_from("owner_id", operation.owner_id_cell()),
            ),
            (
                "start_time",
                self.start_time
                    .merge_from("start_time", operation.start_time_cell()),
            ),
            (
                "end_time",
                self.end_time.merge_from("end_time", operation.end_time_cell()),
            ),
            (
                "exit_code",
                self.exit_code
                    .merge_from("exit_code", operation.exit_code_cell()),
            ),
            (
                "exit_message",
                self.exit_message
                    .merge_from("exit_message", operation.exit_message_cell()),
            ),
        ];

        for (field, outcome) in copies {
            if let Err(e) = outcome {
                trace!("Skipped {} while populating result: {}", field, e);
            }
        }
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
