//! Room-scoped event fan-out for the Swarm execution core.
//!
//! A single-process pub/sub bus delivering state-change events to
//! observers. Delivery is best-effort: the store remains the source of
//! truth, and a bus outage is silent to domain logic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod event;
pub mod room;

pub use bus::{BusConfig, EventBus, SubscriberToken, Subscription};
pub use event::{BusEvent, EventKind, Frame};
pub use room::{Room, RoomParseError};
