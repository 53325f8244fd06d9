//! Load and membership events flowing through the coordinator queues.

use serde::{Deserialize, Serialize};

/// Signal kinds, wire-encoded as integers.
///
/// Membership signals are routed immediately; load signals may be
/// coalesced over a short horizon before a task is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum EventKind {
    ShardChanged,
    ShardLoadChanged,
    ContainerChanged,
    ContainerLoadChanged,
    ContainerInit,
}

impl EventKind {
    pub fn is_deferrable(self) -> bool {
        matches!(self, Self::ShardLoadChanged | Self::ContainerLoadChanged)
    }
}

impl TryFrom<i32> for EventKind {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ShardChanged),
            2 => Ok(Self::ShardLoadChanged),
            3 => Ok(Self::ContainerChanged),
            4 => Ok(Self::ContainerLoadChanged),
            5 => Ok(Self::ContainerInit),
            other => Err(format!("unknown event type {other}")),
        }
    }
}

impl From<EventKind> for i32 {
    fn from(kind: EventKind) -> i32 {
        match kind {
            EventKind::ShardChanged => 1,
            EventKind::ShardLoadChanged => 2,
            EventKind::ContainerChanged => 3,
            EventKind::ContainerLoadChanged => 4,
            EventKind::ContainerInit => 5,
        }
    }
}

/// One queued signal for a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub service: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub enqueue_time: i64,
    /// Payload published verbatim into the service's task slot.
    pub value: String,
}
