//! Room namespaces for scoped subscriptions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use swarm_core::{ProjectId, SessionId, TenantId, TicketId};

/// A subscription namespace.
///
/// Rooms are rendered as `kind:<id>` strings on the wire (`session:<uuid>`,
/// `vm:fleet`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Room {
    /// Updates about one session.
    Session(SessionId),
    /// Updates about one ticket.
    Ticket(TicketId),
    /// Updates about one project.
    Project(ProjectId),
    /// Fleet-wide VM state changes.
    VmFleet,
    /// Everything within one tenant.
    Tenant(TenantId),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Ticket(id) => write!(f, "ticket:{id}"),
            Self::Project(id) => write!(f, "project:{id}"),
            Self::VmFleet => write!(f, "vm:fleet"),
            Self::Tenant(id) => write!(f, "tenant:{id}"),
        }
    }
}

/// Error parsing a room string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid room: {0}")]
pub struct RoomParseError(pub String);

impl FromStr for Room {
    type Err = RoomParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "vm:fleet" {
            return Ok(Self::VmFleet);
        }

        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| RoomParseError(s.to_string()))?;

        let invalid = || RoomParseError(s.to_string());
        match kind {
            "session" => Ok(Self::Session(id.parse().map_err(|_| invalid())?)),
            "ticket" => Ok(Self::Ticket(id.parse().map_err(|_| invalid())?)),
            "project" => Ok(Self::Project(id.parse().map_err(|_| invalid())?)),
            "tenant" => Ok(Self::Tenant(id.parse().map_err(|_| invalid())?)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for Room {
    type Error = RoomParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Room> for String {
    fn from(room: Room) -> Self {
        room.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let rooms = [
            Room::Session(SessionId::generate()),
            Room::Ticket(TicketId::generate()),
            Room::Project(ProjectId::generate()),
            Room::VmFleet,
            Room::Tenant(TenantId::generate()),
        ];
        for room in rooms {
            let parsed: Room = room.to_string().parse().unwrap();
            assert_eq!(parsed, room);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("nope".parse::<Room>().is_err());
        assert!("session:not-a-uuid".parse::<Room>().is_err());
        assert!("vm:other".parse::<Room>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let room = Room::VmFleet;
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, "\"vm:fleet\"");
        let parsed: Room = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, room);
    }
}
