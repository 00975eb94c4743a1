//! Event envelope and frame types delivered to subscribers.

use serde::{Deserialize, Serialize};
use swarm_core::Json;

use crate::room::Room;

/// Recognized event kinds on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Session row changed.
    #[serde(rename = "session.update")]
    SessionUpdate,
    /// Session lifecycle state changed.
    #[serde(rename = "session.state")]
    SessionState,
    /// A new chat message was appended.
    #[serde(rename = "message.new")]
    MessageNew,
    /// A spec blob was generated or revised.
    #[serde(rename = "spec.generated")]
    SpecGenerated,
    /// A human decision is required.
    #[serde(rename = "approval.required")]
    ApprovalRequired,
    /// Ticket row changed.
    #[serde(rename = "ticket.update")]
    TicketUpdate,
    /// Ticket reached `completed`.
    #[serde(rename = "ticket.completed")]
    TicketCompleted,
    /// Aggregate build progress for a session.
    #[serde(rename = "build.progress")]
    BuildProgress,
    /// VM lifecycle change.
    #[serde(rename = "vm.state")]
    VmState,
}

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    /// What happened.
    pub kind: EventKind,
    /// Event detail; opaque to the bus.
    pub payload: Json,
}

impl BusEvent {
    /// Build an event from a kind and payload.
    #[must_use]
    pub fn new(kind: EventKind, payload: Json) -> Self {
        Self { kind, payload }
    }
}

/// A frame delivered to one subscriber.
///
/// Event frames serialize as `{"room": ..., "seq": ..., "event": ...}`,
/// keepalive frames as `{"ping": true}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// A room-scoped event with its per-room sequence number.
    Event {
        /// The room this frame was delivered for.
        room: Room,
        /// Monotonic sequence number scoped to the room.
        seq: u64,
        /// The event itself.
        event: BusEvent,
    },
    /// A keepalive tick.
    Ping {
        /// Always `true`.
        ping: bool,
    },
}

impl Frame {
    /// A keepalive frame.
    #[must_use]
    pub const fn ping() -> Self {
        Self::Ping { ping: true }
    }
}
