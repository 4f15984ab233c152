//! Lifecycle notifications.
//!
//! Services publish [`IndexEvent`]s on a broadcast channel; callers that care
//! subscribe through [`crate::coordinator::Coordinator::subscribe`]. Publishing
//! with no subscribers is not an error.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::recovery::{HealthStatus, RecoveryAction, Severity};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    Built {
        document_id: i64,
        index_path: PathBuf,
        chunk_count: usize,
    },
    Loaded {
        document_id: i64,
    },
    /// Dropped from the query cache, either for capacity or after a rebuild.
    Evicted {
        document_id: i64,
    },
    Recovered {
        document_id: i64,
        severity: Severity,
        action: RecoveryAction,
    },
    OrphansRemoved {
        count: usize,
    },
    HealthChecked {
        status: HealthStatus,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IndexEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: IndexEvent) {
        tracing::trace!(?event, "event");
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }
}
