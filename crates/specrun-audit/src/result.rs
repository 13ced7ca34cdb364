//! Gate outcomes

use serde::{Deserialize, Serialize};
use specrun_artifact::types::BlockingGap;
use specrun_artifact::{Artifact, ContentHash, RunState};

use crate::checks::Rule;
use crate::error::AuditError;

/// Family of a gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateKind {
    /// Structural check; failure always blocks the transition
    Deterministic,
    /// Rubric-scored evaluation; advisory except for sufficiency
    Semantic,
}

/// Pointer to the artifact (and optionally the location inside it) a result is about
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Evidence {
    pub artifact_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointer: Option<String>,
}

impl Evidence {
    #[must_use]
    pub fn of(artifact: &Artifact) -> Self {
        Self {
            artifact_id: artifact.artifact_id().to_string(),
            content_hash: Some(artifact.content_hash),
            pointer: None,
        }
    }

    #[must_use]
    pub fn at(artifact: &Artifact, pointer: impl Into<String>) -> Self {
        Self {
            pointer: Some(pointer.into()),
            ..Self::of(artifact)
        }
    }
}

/// Outcome of one gate against one subject
///
/// Carries no timestamps: evaluating an unchanged artifact set twice yields
/// identical results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub gate_name: String,
    pub kind: GateKind,
    /// Artifact ID the gate was applied to, or `run` for set-wide gates
    pub subject: String,
    pub passed: bool,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocking_gaps: Vec<BlockingGap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric_version: Option<String>,
}

impl AuditResult {
    /// Deterministic result; passes when `messages` is empty
    #[must_use]
    pub fn deterministic(
        gate_name: impl Into<String>,
        subject: impl Into<String>,
        messages: Vec<String>,
        evidence: Vec<Evidence>,
    ) -> Self {
        Self {
            gate_name: gate_name.into(),
            kind: GateKind::Deterministic,
            subject: subject.into(),
            passed: messages.is_empty(),
            messages,
            evidence,
            confidence_score: None,
            threshold: None,
            blocking_gaps: Vec::new(),
            rationale: None,
            rubric_version: None,
        }
    }

    /// Semantic result; passes when `score >= threshold`
    #[must_use]
    pub fn semantic(
        gate_name: impl Into<String>,
        subject: impl Into<String>,
        score: f64,
        threshold: f64,
        evidence: Vec<Evidence>,
    ) -> Self {
        let passed = score >= threshold;
        Self {
            gate_name: gate_name.into(),
            kind: GateKind::Semantic,
            subject: subject.into(),
            passed,
            messages: if passed {
                Vec::new()
            } else {
                vec![format!("score {score:.2} below threshold {threshold:.2}")]
            },
            evidence,
            confidence_score: Some(score),
            threshold: Some(threshold),
            blocking_gaps: Vec::new(),
            rationale: None,
            rubric_version: None,
        }
    }

    #[must_use]
    pub fn with_rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = Some(rationale.into());
        self
    }

    #[must_use]
    pub fn with_rubric_version(mut self, version: impl Into<String>) -> Self {
        self.rubric_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn with_gaps(mut self, gaps: Vec<BlockingGap>) -> Self {
        self.blocking_gaps = gaps;
        self
    }

    #[inline]
    #[must_use]
    pub fn is_hard_failure(&self) -> bool {
        !self.passed && self.kind == GateKind::Deterministic
    }

    #[inline]
    #[must_use]
    pub fn is_soft_failure(&self) -> bool {
        !self.passed && self.kind == GateKind::Semantic
    }

    /// `gate[subject]: first message`
    #[must_use]
    pub fn describe(&self) -> String {
        match self.messages.first() {
            Some(first) => format!("{}[{}]: {first}", self.gate_name, self.subject),
            None => format!("{}[{}]", self.gate_name, self.subject),
        }
    }
}

/// All results of one state's gate evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub state: RunState,
    pub results: Vec<AuditResult>,
}

impl GateReport {
    /// Sorts results by `(gate_name, subject)`
    #[must_use]
    pub fn new(state: RunState, mut results: Vec<AuditResult>) -> Self {
        results.sort_by(|a, b| {
            (a.gate_name.as_str(), a.subject.as_str()).cmp(&(b.gate_name.as_str(), b.subject.as_str()))
        });
        Self { state, results }
    }

    pub fn hard_failures(&self) -> impl Iterator<Item = &AuditResult> {
        self.results.iter().filter(|r| r.is_hard_failure())
    }

    pub fn soft_failures(&self) -> impl Iterator<Item = &AuditResult> {
        self.results.iter().filter(|r| r.is_soft_failure())
    }

    /// No failure of either kind
    #[must_use]
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    /// Subjects with at least one failure of either kind
    #[must_use]
    pub fn failing_subjects(&self) -> Vec<&str> {
        let mut subjects: Vec<&str> = self
            .results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.subject.as_str())
            .collect();
        subjects.sort_unstable();
        subjects.dedup();
        subjects
    }

    /// First deterministic failure as an error, if any
    #[must_use]
    pub fn first_hard_failure(&self) -> Option<AuditError> {
        self.hard_failures().next().map(|r| {
            if r.gate_name == Rule::ReferentialIntegrity.name() {
                AuditError::ReferentialIntegrity {
                    artifact_id: r.subject.clone(),
                    missing: r
                        .messages
                        .iter()
                        .filter_map(|m| m.split_whitespace().next())
                        .map(str::to_string)
                        .collect(),
                }
            } else {
                AuditError::HardGate {
                    gate: r.gate_name.clone(),
                    subject: r.subject.clone(),
                    messages: r.messages.clone(),
                }
            }
        })
    }

    /// One-line summary of the failures, empty when passed
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(AuditResult::describe)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_sorts_and_classifies() {
        let report = GateReport::new(
            RunState::Requirements,
            vec![
                AuditResult::semantic("quality", "run", 0.2, 0.5, vec![]),
                AuditResult::deterministic("completeness", "B", vec!["TBD".into()], vec![]),
                AuditResult::deterministic("completeness", "A", vec![], vec![]),
            ],
        );
        let order: Vec<(&str, &str)> = report
            .results
            .iter()
            .map(|r| (r.gate_name.as_str(), r.subject.as_str()))
            .collect();
        assert_eq!(order, vec![("completeness", "A"), ("completeness", "B"), ("quality", "run")]);
        assert_eq!(report.hard_failures().count(), 1);
        assert_eq!(report.soft_failures().count(), 1);
        assert!(!report.passed());
        assert_eq!(report.failing_subjects(), vec!["B", "run"]);
        assert!(matches!(
            report.first_hard_failure(),
            Some(AuditError::HardGate { ref subject, .. }) if subject == "B"
        ));
    }

    #[test]
    fn dangling_reference_maps_to_referential_error() {
        let report = GateReport::new(
            RunState::Architecture,
            vec![AuditResult::deterministic(
                "referential_integrity",
                "ImplementableSpec",
                vec!["ADR-0042 is referenced but not defined in this run".into()],
                vec![],
            )],
        );
        match report.first_hard_failure() {
            Some(AuditError::ReferentialIntegrity { missing, .. }) => {
                assert_eq!(missing, vec!["ADR-0042".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn semantic_threshold_inclusive() {
        assert!(AuditResult::semantic("g", "run", 0.6, 0.6, vec![]).passed);
        assert!(!AuditResult::semantic("g", "run", 0.59, 0.6, vec![]).passed);
    }
}
