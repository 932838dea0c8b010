//! Cache notifications.
//!
//! Events fan out over a broadcast channel. Publishing never waits for and
//! never requires a subscriber; slow subscribers lose the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::cache::entry::Layer;
use crate::metrics::MetricsSnapshot;

/// Buffered events per subscriber before lagging.
const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CacheEvent {
    Written {
        key: String,
        layers: Vec<Layer>,
    },
    Deleted {
        key: String,
    },
    Cleared {
        layers: Vec<Layer>,
    },
    Evicted {
        layer: Layer,
        key: String,
        demoted_to: Option<Layer>,
    },
    CleanupSwept {
        layer: Layer,
        removed: usize,
    },
    Invalidated {
        tags: Vec<String>,
        removed: usize,
    },
    MetricsUpdated(Box<MetricsSnapshot>),
    OperationError {
        operation: &'static str,
        key: Option<String>,
        message: String,
    },
    Stopped,
}

impl CacheEvent {
    /// Stable name, used as the SSE event type.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::Written { .. } => "written",
            CacheEvent::Deleted { .. } => "deleted",
            CacheEvent::Cleared { .. } => "cleared",
            CacheEvent::Evicted { .. } => "evicted",
            CacheEvent::CleanupSwept { .. } => "cleanup_swept",
            CacheEvent::Invalidated { .. } => "invalidated",
            CacheEvent::MetricsUpdated(_) => "metrics_updated",
            CacheEvent::OperationError { .. } => "operation_error",
            CacheEvent::Stopped => "stopped",
        }
    }
}

/// Publishing side of the notification channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CacheEvent) {
        // An error only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Report a failure that was absorbed instead of returned.
    pub fn error(&self, operation: &'static str, key: Option<&str>, message: impl ToString) {
        self.publish(CacheEvent::OperationError {
            operation,
            key: key.map(str::to_string),
            message: message.to_string(),
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
