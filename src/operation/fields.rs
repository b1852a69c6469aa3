// ABOUTME: Write-once field cell shared by operations and their results
// ABOUTME: Rejects a second write and fails loudly when an unset field is read

use serde::{Deserialize, Serialize};

use super::error::{OperationError, Result};

/// Epoch seconds (UTC).
pub type Timestamp = i64;

/// A value that may be assigned exactly once.
///
/// The field name is supplied at each call so errors point at the offending
/// attribute without the cell having to carry it around in persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WriteOnce<T>(Option<T>);

impl<T> Default for WriteOnce<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T> WriteOnce<T> {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn with_value(value: T) -> Self {
        Self(Some(value))
    }

    pub fn set(&mut self, field: &'static str, value: T) -> Result<()> {
        if self.0.is_some() {
            return Err(OperationError::AlreadySet { field });
        }
        self.0 = Some(value);
        Ok(())
    }

    pub fn get(&self, field: &'static str) -> Result<&T> {
        self.0
            .as_ref()
            .ok_or(OperationError::NotYetAvailable { field })
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn as_option(&self) -> Option<&T> {
        self.0.as_ref()
    }

    /// Bypasses the write-once guard. Only force-fail may do this.
    pub(crate) fn overwrite(&mut self, value: T) {
        self.0 = Some(value);
    }
}

impl<T: Clone> WriteOnce<T> {
    pub fn value(&self, field: &'static str) -> Result<T> {
        self.get(field).cloned()
    }
}

impl<T: Clone + PartialEq> WriteOnce<T> {
    /// Copies `source` into this cell when it is unset.
    ///
    /// Copying an equal value onto an already-set cell is a no-op; a
    /// conflicting value is reported as `AlreadySet`.
    pub fn merge_from(&mut self, field: &'static str, source: &WriteOnce<T>) -> Result<()> {
        let value = source.get(field)?;
        match &self.0 {
            Some(existing) if existing == value => Ok(()),
            Some(_) => Err(OperationError::AlreadySet { field }),
            None => {
                self.0 = Some(value.clone());
                Ok(())
            }
        }
    }
}

pub(crate) fn validate_timestamp(field: &'static str, value: Timestamp) -> Result<()> {
    if value < 0 {
        return Err(OperationError::invalid(
            field,
            format!("timestamp must not be negative (got {})", value),
        ));
    }
    Ok(())
}
