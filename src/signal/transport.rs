// ABOUTME: Contract for the out-of-band channel that delivers completion signals
// ABOUTME: Includes an in-memory transport that collapses duplicate deliveries

use async_trait::async_trait;
use indexmap::IndexMap;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use super::message::Signal;
use crate::operation::Result;

#[async_trait]
pub trait SignalTransport: Send + Sync {
    /// Unconsumed signals addressed to `owner_id`, in delivery order.
    async fn pending_for_owner(&self, owner_id: &str) -> Result<Vec<Signal>>;

    /// Idempotent. Returns whether the consumed flag changed.
    async fn mark_consumed(&self, signal_id: Uuid) -> Result<bool>;

    /// Returns whether a signal was removed.
    async fn delete(&self, signal_id: Uuid) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct StoredSignal {
    signal: Signal,
    consumed: bool,
}

#[derive(Debug, Default)]
pub struct InMemorySignalTransport {
    signals: RwLock<IndexMap<Uuid, StoredSignal>>,
}

impl InMemorySignalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a signal from a backend. A repeated signal id is ignored.
    pub async fn deliver(&self, signal: Signal) -> bool {
        let mut signals = self.signals.write().await;
        if signals.contains_key(&signal.signal_id) {
            debug!("Dropping duplicate delivery of signal {}", signal.signal_id);
            return false;
        }
        signals.insert(
            signal.signal_id,
            StoredSignal {
                signal,
                consumed: false,
            },
        );
        true
    }

    pub async fn is_consumed(&self, signal_id: Uuid) -> Option<bool> {
        let signals = self.signals.read().await;
        signals.get(&signal_id).map(|stored| stored.consumed)
    }

    pub async fn len(&self) -> usize {
        self.signals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.signals.read().await.is_empty()
    }
}

#[async_trait]
impl SignalTransport for InMemorySignalTransport {
    async fn pending_for_owner(&self, owner_id: &str) -> Result<Vec<Signal>> {
        let signals = self.signals.read().await;
        Ok(signals
            .values()
            .filter(|stored| !stored.consumed && stored.signal.owner_id == owner_id)
            .map(|stored| stored.signal.clone())
            .collect())
    }

    async fn mark_consumed(&self, signal_id: Uuid) -> Result<bool> {
        let mut signals = self.signals.write().await;
        match signals.get_mut(&signal_id) {
            Some(stored) if !stored.consumed => {
                stored.consumed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, signal_id: Uuid) -> Result<bool> {
        let mut signals = self.signals.write().await;
        Ok(signals.shift_remove(&signal_id).is_some())
    }
}
