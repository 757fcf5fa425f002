//! Rollout events for operator visibility.
//!
//! Events are published after the write that caused them has committed.

use std::sync::Arc;

use fleetgrid_state::{GroupId, GroupStatus, RolloutId, RolloutStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    Created {
        rollout: RolloutId,
        name: String,
        groups: usize,
    },
    StatusChanged {
        rollout: RolloutId,
        from: RolloutStatus,
        to: RolloutStatus,
    },
    GroupStatusChanged {
        rollout: RolloutId,
        group: GroupId,
        from: GroupStatus,
        to: GroupStatus,
    },
    ActionsCreated {
        rollout: RolloutId,
        group: GroupId,
        created: usize,
        superseded: usize,
    },
    ActionsCancelled {
        rollout: RolloutId,
        count: usize,
    },
    ErrorThresholdTripped {
        rollout: RolloutId,
        group: GroupId,
        errors: u64,
    },
    /// The engine gave up on the rollout and moved it to `status`.
    Failed {
        rollout: RolloutId,
        status: RolloutStatus,
        reason: String,
    },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: RolloutEvent);
}

/// Writes every event to the tracing subscriber.
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: RolloutEvent) {
        match &event {
            RolloutEvent::ErrorThresholdTripped {
                rollout,
                group,
                errors,
            } => warn!(rollout, group, errors, "error threshold tripped"),
            RolloutEvent::Failed {
                rollout,
                status,
                reason,
            } => warn!(rollout, ?status, %reason, "rollout failed"),
            other => info!(event = ?other, "rollout event"),
        }
    }
}

/// Fans events out to in-process subscribers (UI streams, tests).
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<RolloutEvent>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: RolloutEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Publishes to several sinks in order.
pub struct MultiSink(pub Vec<Arc<dyn EventSink>>);

impl EventSink for MultiSink {
    fn publish(&self, event: RolloutEvent) {
        for sink in &self.0 {
            sink.publish(event.clone());
        }
    }
}
