//! Work Queue
//!
//! Keyed queue feeding reconciliation workers. A key is held by at most one
//! worker at a time; enqueuing a key that is already queued is a no-op, and
//! enqueuing a key that is in flight marks it dirty so it is requeued once
//! the worker finishes. Different keys proceed in parallel.

use crate::observer::correlation::CorrelationKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Queued,
    InFlight { dirty: bool },
}

/// Deduplicating work queue keyed by correlation key
pub struct WorkQueue {
    slots: DashMap<CorrelationKey, SlotState>,
    ready_tx: mpsc::UnboundedSender<CorrelationKey>,
    ready_rx: Mutex<mpsc::UnboundedReceiver<CorrelationKey>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            slots: DashMap::new(),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
        }
    }

    /// Add a key; returns whether it became newly ready
    pub fn enqueue(&self, key: CorrelationKey) -> bool {
        match self.slots.entry(key.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(SlotState::Queued);
                // The receiver lives as long as the queue
                let _ = self.ready_tx.send(key);
                true
            }
            Entry::Occupied(mut slot) => {
                if let SlotState::InFlight { dirty } = slot.get_mut() {
                    trace!(volume = %key, "key in flight, marking dirty");
                    *dirty = true;
                }
                false
            }
        }
    }

    /// Wait for the next ready key and mark it in flight
    pub async fn next(&self) -> Option<CorrelationKey> {
        let key = self.ready_rx.lock().await.recv().await?;
        self.slots
            .insert(key.clone(), SlotState::InFlight { dirty: false });
        Some(key)
    }

    /// Release a key taken with `next`, requeuing it if it changed meanwhile
    pub fn done(&self, key: &CorrelationKey) {
        let requeue = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut slot) => match *slot.get() {
                SlotState::InFlight { dirty: true } => {
                    slot.insert(SlotState::Queued);
                    true
                }
                _ => {
                    slot.remove();
                    false
                }
            },
            Entry::Vacant(_) => false,
        };
        if requeue {
            let _ = self.ready_tx.send(key.clone());
        }
    }

    /// Keys queued or in flight
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
