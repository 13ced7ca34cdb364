//! Audit errors

/// Errors raised by the audit engine and its evaluators
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// A cross-referenced stable ID is not defined anywhere in the run
    #[error("dangling references in {artifact_id}: {}", missing.join(", "))]
    ReferentialIntegrity {
        artifact_id: String,
        missing: Vec<String>,
    },

    /// Any other deterministic gate failed
    #[error("gate {gate} failed for {subject}: {}", messages.join("; "))]
    HardGate {
        gate: String,
        subject: String,
        messages: Vec<String>,
    },

    /// The semantic evaluator could not produce a score
    #[error("semantic evaluator failed: {0}")]
    Evaluator(String),

    /// A policy value is out of range or malformed
    #[error("invalid audit policy: {0}")]
    InvalidPolicy(String),
}

impl AuditError {
    /// Whether the orchestrator may route back to revision
    #[inline]
    #[must_use]
    pub fn is_revisable(&self) -> bool {
        matches!(self, Self::ReferentialIntegrity { .. } | Self::HardGate { .. })
    }
}
