//! specrun Orchestration Core
//!
//! The gated state machine that turns a feature description into a run of
//! audited specification artifacts.
//!
//! # Architecture
//!
//! ```text
//! PipelineInput
//!     |
//!     v
//! Orchestrator ──> RoleExecutor (rate-limited, per instance)
//!     |                 |
//!     |                 v
//!     |           candidates ──> synthesis ──> ArtifactStore
//!     v
//! AuditEngine ──> advance | revise | stop ──> CollaborationLog
//! ```
//!
//! - [`Orchestrator`]: drives `Intake -> ... -> Review -> Final`, resumable
//!   from persisted metadata
//! - [`RoleExecutor`]: the seam language-model backends plug into;
//!   [`DryRunExecutor`] ships as the deterministic default
//! - [`rate_limit`]: exponential backoff honouring provider reset hints
//! - [`CollaborationLog`]: hash-chained JSONL of every decision
//! - [`derived`]: amendments and derived runs
//!
//! # Example
//!
//! ```rust,ignore
//! use specrun_artifact::PipelineInput;
//! use specrun_core::{ExecutorRegistry, Orchestrator, PipelineConfig};
//!
//! let orchestrator = Orchestrator::new(PipelineConfig::default(), ExecutorRegistry::dry_run());
//! let outcome = orchestrator
//!     .start(PipelineInput::new("Build a task tracker with due dates and reminders"))
//!     .await?;
//! assert!(outcome.is_success());
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod collaboration;
pub mod config;
pub mod derived;
mod error;
pub mod executor;
pub mod orchestrator;
pub mod rate_limit;
mod role;
pub mod state_machine;
pub mod synthesis;

pub use collaboration::{
    Actor, CollaborationEvent, CollaborationLog, ContentRef, Decision, EventType, NewEvent,
    TranscriptStore,
};
pub use config::{AuditConfig, OnInsufficient, PipelineConfig, RoleOverride};
pub use derived::{affected_closure, Amendment};
pub use error::{
    ConfigError, DerivedRunError, ExecutorError, LogError, OrchestratorError, RateLimitError,
    StateMachineError,
};
pub use executor::{
    DryRunExecutor, ExecutorRegistry, InstanceMode, RoleExecutor, RoleOutput, RoleRequest,
};
pub use orchestrator::{decide, AuditRecord, Orchestrator, RunOutcome, Verdict};
pub use rate_limit::{invoke_with_retry, RetryPolicy};
pub use role::{Role, UnknownRole};
pub use synthesis::{InstancePattern, InstancePolicy, Resolution};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
