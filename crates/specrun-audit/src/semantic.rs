//! Semantic evaluation seam
//!
//! The core only defines how a rubric score is requested and consumed.
//! Scoring itself belongs to whatever evaluator the embedding application
//! registers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use specrun_artifact::Artifact;

use crate::error::AuditError;

/// What a semantic gate asks the evaluator to judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub criteria: Vec<String>,
}

impl Rubric {
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            criteria: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.criteria = criteria;
        self
    }
}

/// Evaluator verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticScore {
    /// In `[0, 1]`
    pub score: f64,
    pub rationale: String,
    pub evidence_refs: Vec<String>,
}

/// Pluggable rubric scorer
#[async_trait]
pub trait SemanticEvaluator: Send + Sync {
    /// Score `artifacts` against `rubric`
    async fn evaluate(
        &self,
        rubric: &Rubric,
        artifacts: &[Artifact],
    ) -> Result<SemanticScore, AuditError>;
}

/// Scores everything 1.0; used when no evaluator is registered
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralEvaluator;

#[async_trait]
impl SemanticEvaluator for NeutralEvaluator {
    async fn evaluate(
        &self,
        rubric: &Rubric,
        artifacts: &[Artifact],
    ) -> Result<SemanticScore, AuditError> {
        let mut evidence_refs: Vec<String> =
            artifacts.iter().map(|a| a.artifact_id().to_string()).collect();
        evidence_refs.sort();
        Ok(SemanticScore {
            score: 1.0,
            rationale: format!("no evaluator configured for rubric {}", rubric.name),
            evidence_refs,
        })
    }
}

/// Clamp an evaluator score into `[0, 1]`, mapping NaN to 0
#[must_use]
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        0.0
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn neutral_evaluator_passes_everything() {
        let score = NeutralEvaluator
            .evaluate(&Rubric::new("quality", "v1"), &[])
            .await
            .unwrap();
        assert!((score.score - 1.0).abs() < f64::EPSILON);
        assert!(score.evidence_refs.is_empty());
    }

    #[test]
    fn scores_clamped() {
        assert!((clamp_score(1.7) - 1.0).abs() < f64::EPSILON);
        assert!(clamp_score(-0.2).abs() < f64::EPSILON);
        assert!(clamp_score(f64::NAN).abs() < f64::EPSILON);
    }
}
