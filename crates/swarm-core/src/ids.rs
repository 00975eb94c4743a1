//! Strongly-typed identifiers for tickets, sessions, projects, tenants, and VMs.
//!
//! Ticket, session, project, and tenant IDs are UUID v4 newtypes. VM
//! identities are 32-byte blake3 digests derived from the ticket they are
//! bound to, so a respawn after a crashed attempt produces a fresh identity
//! without any central counter.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a single unit of agent work.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TicketId(uuid::Uuid);

/// Identifier of a HITL session.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionId(uuid::Uuid);

/// Identifier of a project owning sessions and tickets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(uuid::Uuid);

/// Identifier of a tenant boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(uuid::Uuid);

macro_rules! uuid_id_impl {
    ($name:ident) => {
        impl $name {
            /// Create from an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }

            /// Generate a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4())
            }

            /// The underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }

            /// The raw 16 identifier bytes.
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
                Ok(Self(uuid))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl TryFrom<String> for $name {
            type Error = IdError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.to_string()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }
    };
}

uuid_id_impl!(TicketId);
uuid_id_impl!(SessionId);
uuid_id_impl!(ProjectId);
uuid_id_impl!(TenantId);

/// A 32-byte VM identity, hex-encoded for display.
///
/// Derived via blake3 from the owning ticket, the attempt number, and a
/// timestamp. Each attempt on a ticket therefore binds a distinct VM
/// identity, which is what makes invariant checks like "exactly one ticket
/// per VM" enforceable from the store alone.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmId([u8; 32]);

impl VmId {
    /// Create a `VmId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Allocate a fresh VM identity for an attempt on a ticket.
    #[must_use]
    pub fn allocate(ticket_id: &TicketId, attempt: u32) -> Self {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();

        let mut hasher = blake3::Hasher::new();
        hasher.update(ticket_id.as_bytes());
        hasher.update(&attempt.to_le_bytes());
        hasher.update(&timestamp.to_le_bytes());

        Self(*hasher.finalize().as_bytes())
    }

    /// Derive a deterministic VM identity for tests.
    #[must_use]
    pub fn allocate_deterministic(ticket_id: &TicketId, attempt: u32, seed: u64) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(ticket_id.as_bytes());
        hasher.update(&attempt.to_le_bytes());
        hasher.update(&seed.to_le_bytes());

        Self(*hasher.finalize().as_bytes())
    }

    /// Parse a `VmId` from a hex-encoded string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hex or not exactly 64
    /// characters.
    pub fn from_hex(s: &str) -> Result<Self, IdError> {
        let bytes = hex::decode(s).map_err(|_| IdError::InvalidHex)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: 32,
            got: s.len() / 2,
        })?;
        Ok(Self(arr))
    }

    /// The underlying bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex-encoded string representation.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmId({})", self.to_hex())
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for VmId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl TryFrom<String> for VmId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<VmId> for String {
    fn from(id: VmId) -> Self {
        id.to_hex()
    }
}

impl AsRef<[u8]> for VmId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The input string contains invalid hexadecimal characters.
    #[error("invalid hex encoding")]
    InvalidHex,

    /// The input has an incorrect length.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength {
        /// The expected number of bytes.
        expected: usize,
        /// The actual number of bytes.
        got: usize,
    },

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_id_roundtrip() {
        let id = TicketId::generate();
        let parsed = TicketId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ticket_id_invalid() {
        assert!(matches!(
            TicketId::from_str("not-a-uuid"),
            Err(IdError::InvalidUuid)
        ));
    }

    #[test]
    fn session_id_serde_json() {
        let id = SessionId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn tenant_id_serde_json() {
        let id = TenantId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn vm_id_deterministic() {
        let ticket = TicketId::generate();
        let a = VmId::allocate_deterministic(&ticket, 1, 42);
        let b = VmId::allocate_deterministic(&ticket, 1, 42);
        assert_eq!(a, b);

        let c = VmId::allocate_deterministic(&ticket, 2, 42);
        assert_ne!(a, c);
    }

    #[test]
    fn vm_id_unique_per_allocation() {
        let ticket = TicketId::generate();
        let a = VmId::allocate(&ticket, 1);
        let b = VmId::allocate(&ticket, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn vm_id_hex_roundtrip() {
        let id = VmId::from_bytes([0x5a; 32]);
        let parsed = VmId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn vm_id_wrong_length() {
        assert!(matches!(
            VmId::from_hex("deadbeef"),
            Err(IdError::InvalidLength { .. })
        ));
    }
}
