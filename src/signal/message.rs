// ABOUTME: Asynchronous completion notice pushed by a backend about one operation
// ABOUTME: Carries enough payload to build the operation's result without a probe

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{OperationId, OperationResult, Result, ResultPayload, Timestamp};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalPayload {
    pub exit_code: i32,
    #[serde(default)]
    pub exit_message: Option<String>,
    #[serde(default)]
    pub start_time: Option<Timestamp>,
    #[serde(default)]
    pub end_time: Option<Timestamp>,
    #[serde(default)]
    pub output: ResultPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: Uuid,
    /// Task the operation belongs to; transports are queried by this id.
    pub owner_id: String,
    pub operation_id: OperationId,
    pub received_at: Timestamp,
    pub payload: SignalPayload,
}

impl Signal {
    pub fn completion(
        owner_id: impl Into<String>,
        operation_id: OperationId,
        exit_code: i32,
        received_at: Timestamp,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            operation_id,
            received_at,
            payload: SignalPayload {
                exit_code,
                ..Default::default()
            },
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.payload.exit_message = Some(message.into());
        self
    }

    pub fn with_times(mut self, start_time: Timestamp, end_time: Timestamp) -> Self {
        self.payload.start_time = Some(start_time);
        self.payload.end_time = Some(end_time);
        self
    }

    pub fn with_output(mut self, output: ResultPayload) -> Self {
        self.payload.output = output;
        self
    }

    /// Builds the result this signal reports.
    pub fn to_result(&self) -> Result<OperationResult> {
        let mut result = OperationResult::new();
        result.set_id(self.operation_id.clone())?;
        result.set_owner_id(self.owner_id.clone())?;
        result.set_exit_code(self.payload.exit_code)?;
        if let Some(message) = &self.payload.exit_message {
            result.set_exit_message(message.clone())?;
        }
        if let Some(start_time) = self.payload.start_time {
            result.set_start_time(start_time)?;
        }
        if let Some(end_time) = self.payload.end_time {
            result.set_end_time(end_time)?;
        }
        result.set_payload(self.payload.output.clone());
        Ok(result)
    }
}
