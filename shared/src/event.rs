use serde::Serialize;

use crate::capabilities::ErrorCategory;
use crate::model::{LocalId, RemoteId, SyncResult};

/// Queue-changed notifications, broadcast to every subscriber.
///
/// Slow subscribers may lag and miss events; the authoritative view is always
/// `pending_count()` / `drained_snapshot()`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    /// `submit` reached the remote store directly.
    Delivered { remote_id: RemoteId },
    Enqueued { local_id: LocalId, pending: usize },
    Synced {
        local_id: LocalId,
        remote_id: RemoteId,
        pending: usize,
    },
    DeliveryFailed {
        local_id: LocalId,
        attempts: u32,
        category: ErrorCategory,
    },
    PassFinished(SyncResult),
}

impl QueueEvent {
    pub fn name(&self) -> &'static str {
        match self {
            QueueEvent::Delivered { .. } => "delivered",
            QueueEvent::Enqueued { .. } => "enqueued",
            QueueEvent::Synced { .. } => "synced",
            QueueEvent::DeliveryFailed { .. } => "delivery_failed",
            QueueEvent::PassFinished(_) => "pass_finished",
        }
    }

    /// Queue length right after the event, when the event changed it.
    pub fn pending(&self) -> Option<usize> {
        match self {
            QueueEvent::Enqueued { pending, .. } | QueueEvent::Synced { pending, .. } => {
                Some(*pending)
            }
            _ => None,
        }
    }
}
