//! Dispatcher, lease monitor, and verification/cascade engine.
//!
//! The execution side of the platform: claims ready tickets, binds them to
//! isolated VMs, tracks lease liveness, verifies agent results, opens PRs,
//! cascades dependency unblocking, and finishes sessions. All durable
//! state lives in the store; every component here is restartable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cascade;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod lease;
pub mod registry;
pub mod transitions;
pub mod verify;

pub use cascade::{check_session_completion, unblock_descendants, CascadeWorker, CompletionSignal};
pub use coordinator::{build_core, start_core, ExecutionCore, RunningCore};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result};
pub use lease::{HeartbeatPublisher, StaleReclaimer};
pub use registry::VmRegistry;
pub use verify::{AgentResult, CriterionUpdate, ResultOutcome, ResultPipeline};
