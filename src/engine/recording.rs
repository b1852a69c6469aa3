// ABOUTME: Per-run transcripts of the transitions a task took
// ABOUTME: Transcripts diff against each other while ignoring timestamps

use serde::{Deserialize, Serialize};

use crate::operation::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEntry {
    pub state: String,
    pub value: String,
    pub next_state: String,
    pub at: Timestamp,
}

impl RecordEntry {
    fn same_transition(&self, other: &RecordEntry) -> bool {
        self.state == other.state && self.value == other.value && self.next_state == other.next_state
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingDiff {
    Changed {
        index: usize,
        expected: RecordEntry,
        actual: RecordEntry,
    },
    /// Present in the baseline only.
    Missing { index: usize, entry: RecordEntry },
    /// Present in the compared transcript only.
    Extra { index: usize, entry: RecordEntry },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    pub run: u32,
    pub started_at: Timestamp,
    pub entries: Vec<RecordEntry>,
}

impl Recording {
    pub fn new(run: u32, started_at: Timestamp) -> Self {
        Self {
            run,
            started_at,
            entries: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        state: impl Into<String>,
        value: impl Into<String>,
        next_state: impl Into<String>,
        at: Timestamp,
    ) {
        self.entries.push(RecordEntry {
            state: state.into(),
            value: value.into(),
            next_state: next_state.into(),
            at,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry-by-entry comparison with `other`, treating `self` as the baseline.
    pub fn diff(&self, other: &Recording) -> Vec<RecordingDiff> {
        let mut diffs = Vec::new();
        let longest = self.entries.len().max(other.entries.len());
        for index in 0..longest {
            match (self.entries.get(index), other.entries.get(index)) {
                (Some(expected), Some(actual)) if !expected.same_transition(actual) => {
                    diffs.push(RecordingDiff::Changed {
                        index,
                        expected: expected.clone(),
                        actual: actual.clone(),
                    });
                }
                (Some(entry), None) => diffs.push(RecordingDiff::Missing {
                    index,
                    entry: entry.clone(),
                }),
                (None, Some(entry)) => diffs.push(RecordingDiff::Extra {
                    index,
                    entry: entry.clone(),
                }),
                _ => {}
            }
        }
        diffs
    }

    pub fn is_equivalent(&self, other: &Recording) -> bool {
        self.diff(other).is_empty()
    }
}
