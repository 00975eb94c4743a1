//! External interface adapters for the Swarm execution core.
//!
//! Four narrow async traits cover every external collaborator: the LLM,
//! the VM spawn backend, the VCS, and the verifier. Each comes with an
//! HTTP (or Kubernetes) implementation and a test double; the core invokes
//! collaborators only through the traits. Native failures are translated
//! into [`AdapterError`] at this boundary so callers branch on the shared
//! fault taxonomy alone.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod llm;
pub mod pod;
pub mod retry;
pub mod vcs;
pub mod verifier;
pub mod vm;

pub use error::{AdapterError, Result};
pub use llm::{
    ChatMessage, ChatRole, Completion, CompletionRequest, HttpLlmClient, LlmClient,
    ScriptedLlmClient, TokenUsage,
};
pub use pod::{PodBackendConfig, PodVmBackend};
pub use retry::{requeue_backoff, retry_with_backoff, BackoffPolicy};
pub use vcs::{CommitSpec, FileChange, HttpVcsClient, PrRequest, RecordingVcs, VcsClient};
pub use verifier::{HttpVerifier, StaticVerifier, Verdict, VerdictStatus, Verifier, VerifyRequest};
pub use vm::{FakeVmBackend, JobContext, NoopVmBackend, VmBackend, VmHandle};
