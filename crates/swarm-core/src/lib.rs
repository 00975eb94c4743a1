//! Core types for the Swarm execution platform.
//!
//! This crate provides the strongly-typed identifiers, the shared fault
//! taxonomy, and the runtime configuration consumed by every other crate in
//! the workspace. It has no knowledge of storage, transport, or scheduling.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod ids;

pub use config::CoreConfig;
pub use error::{Classified, FaultClass};
pub use ids::{IdError, ProjectId, SessionId, TenantId, TicketId, VmId};

/// Opaque JSON payload carried through the core without inspection.
///
/// Used for event metadata, agent output blobs, and repository analysis
/// results. Anything the core actually branches on gets a typed record
/// parsed at the adapter boundary instead.
pub type Json = serde_json::Value;
