// ABOUTME: Ordered, persistable queue of signals fetched for one task
// ABOUTME: Remembers consumed signal ids so redelivered signals are never applied twice

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use super::message::Signal;
use crate::operation::Timestamp;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalQueue {
    pending: VecDeque<Signal>,
    /// Consumed signal ids and when each signal was received.
    consumed: BTreeMap<Uuid, Timestamp>,
    /// Consumed locally but not yet acknowledged to the transport.
    #[serde(default)]
    unacked: Vec<Uuid>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a signal unless it was already consumed or is already queued.
    pub fn enqueue(&mut self, signal: Signal) -> bool {
        if self.consumed.contains_key(&signal.signal_id)
            || self.pending.iter().any(|s| s.signal_id == signal.signal_id)
        {
            return false;
        }
        self.pending.push_back(signal);
        true
    }

    pub fn pending(&self) -> impl Iterator<Item = &Signal> {
        self.pending.iter()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn take(&mut self, signal_id: Uuid) -> Option<Signal> {
        let index = self.pending.iter().position(|s| s.signal_id == signal_id)?;
        self.pending.remove(index)
    }

    /// Returns `false` when the signal had already been consumed.
    pub fn mark_consumed(&mut self, signal_id: Uuid, received_at: Timestamp) -> bool {
        if self.consumed.contains_key(&signal_id) {
            return false;
        }
        self.consumed.insert(signal_id, received_at);
        self.unacked.push(signal_id);
        true
    }

    pub fn is_consumed(&self, signal_id: Uuid) -> bool {
        self.consumed.contains_key(&signal_id)
    }

    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }

    /// Forgets consumed ids of signals received more than `retention` before `now`.
    ///
    /// Returns how many ids were dropped.
    pub fn prune_consumed(&mut self, now: Timestamp, retention: Duration) -> usize {
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        let before = self.consumed.len();
        self.consumed
            .retain(|_, received_at| received_at.saturating_add(retention) >= now);
        before - self.consumed.len()
    }

    /// Drains the ids whose consumption still has to reach the transport.
    pub fn take_acks(&mut self) -> Vec<Uuid> {
        std::mem::take(&mut self.unacked)
    }

    /// Puts back an acknowledgement the transport failed to record.
    pub fn requeue_ack(&mut self, signal_id: Uuid) {
        if !self.unacked.contains(&signal_id) {
            self.unacked.push(signal_id);
        }
    }

    /// Ids of pending signals received more than `retention` before `now`.
    pub fn expired(&self, now: Timestamp, retention: Duration) -> Vec<Uuid> {
        let retention = i64::try_from(retention.as_secs()).unwrap_or(i64::MAX);
        self.pending
            .iter()
            .filter(|s| s.received_at.saturating_add(retention) < now)
            .map(|s| s.signal_id)
            .collect()
    }
}
