use crate::{NodeId, NodeKind, Significance};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Structured events emitted by the engine for the assistant-facing
/// collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    NodeUpserted {
        node_id: NodeId,
        kind: NodeKind,
        significance: Significance,
    },
    NodeRemoved {
        node_id: NodeId,
    },
    IndexRebuilt {
        previous_count: u64,
        new_count: u64,
        duration_ms: u64,
    },
    CacheInvalidated {
        reason: String,
        key_count: usize,
    },
    ParseError {
        file: String,
        message: String,
    },
}

/// Fan-out bus over crossbeam channels. Subscribers that fall away are
/// pruned on the next emit.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
