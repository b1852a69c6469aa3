// ABOUTME: Injectable time source and the per-task step timer
// ABOUTME: Manual clocks let tests drive missing-signal windows and wait times

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::operation::Timestamp;

pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp()
    }
}

#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) -> Timestamp {
        self.now.fetch_add(seconds, Ordering::SeqCst) + seconds
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// When a task was created, last stepped, and is next due.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTimer {
    pub created_at: Timestamp,
    pub last_step_at: Option<Timestamp>,
    pub next_wake_at: Option<Timestamp>,
    pub steps: u64,
}

impl StepTimer {
    pub fn new(created_at: Timestamp) -> Self {
        Self {
            created_at,
            ..Default::default()
        }
    }

    pub fn record_step(&mut self, now: Timestamp, next_wake_at: Option<Timestamp>) {
        self.last_step_at = Some(now);
        self.next_wake_at = next_wake_at;
        self.steps += 1;
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_wake_at.map_or(true, |at| at <= now)
    }
}
