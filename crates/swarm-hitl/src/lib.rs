//! Human-in-the-loop session state machine and spec-to-ticket generator.
//!
//! Drives a project from a natural-language description through
//! clarification, spec review, and approval, then converts the approved
//! spec into the dependency DAG of tickets the dispatcher consumes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod clarify;
pub mod coverage;
pub mod error;
pub mod generator;
pub mod lifecycle;
pub mod service;
pub mod specgen;

pub use clarify::ClarifierReply;
pub use error::{HitlError, Result};
pub use service::{ActivationSummary, ApprovalContext, HitlService, RespondOutcome};
