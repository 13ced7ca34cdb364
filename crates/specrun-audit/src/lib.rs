//! specrun Audit Gates
//!
//! Deterministic rules and rubric-scored semantic gates that decide whether
//! a run may leave a state.
//!
//! - [`checks`]: envelope, completeness, stable-ID, consistency and
//!   traceability rules; failures are hard gates
//! - [`SemanticEvaluator`]: pluggable scorer, [`NeutralEvaluator`] by default
//! - [`SufficiencyPolicy`]: the information-sufficiency stop condition
//! - [`TraceabilityMatrix`]: requirement rows against work columns
//! - [`AuditEngine`]: evaluates a [`StateGates`] set into a [`GateReport`]
//!
//! Evaluation holds no state between calls: an unchanged artifact set
//! always produces the same report.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod checks;
mod engine;
mod error;
mod result;
mod semantic;
pub mod sufficiency;
pub mod traceability;

pub use checks::{MarkerMatcher, Rule, DEFAULT_MARKERS};
pub use engine::{AuditEngine, SemanticGate, StateGates};
pub use error::AuditError;
pub use result::{AuditResult, Evidence, GateKind, GateReport};
pub use semantic::{clamp_score, NeutralEvaluator, Rubric, SemanticEvaluator, SemanticScore};
pub use sufficiency::{SufficiencyAssessment, SufficiencyPolicy, TopicRubric};
pub use traceability::TraceabilityMatrix;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
