//! Gate evaluation for one orchestrator state

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use specrun_artifact::{Artifact, RunState};
use tracing::{debug, warn};

use crate::checks::{self, MarkerMatcher, Rule};
use crate::result::{AuditResult, Evidence, GateReport};
use crate::semantic::{clamp_score, NeutralEvaluator, Rubric, SemanticEvaluator};

/// A rubric-scored gate with its pass threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticGate {
    pub name: String,
    pub rubric: Rubric,
    pub threshold: f64,
}

/// Gates a state must pass before the orchestrator advances
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateGates {
    #[serde(default)]
    pub deterministic: Vec<Rule>,
    #[serde(default)]
    pub semantic: Vec<SemanticGate>,
}

impl StateGates {
    /// Per-artifact structural rules only
    #[must_use]
    pub fn structural() -> Self {
        Self {
            deterministic: vec![
                Rule::Envelope,
                Rule::Completeness,
                Rule::DuplicateStableIds,
                Rule::ReferentialIntegrity,
            ],
            semantic: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_rule(mut self, rule: Rule) -> Self {
        if !self.deterministic.contains(&rule) {
            self.deterministic.push(rule);
        }
        self
    }

    #[must_use]
    pub fn with_semantic(mut self, gate: SemanticGate) -> Self {
        self.semantic.push(gate);
        self
    }
}

/// Runs deterministic rules and semantic gates
#[derive(Clone)]
pub struct AuditEngine {
    evaluator: Arc<dyn SemanticEvaluator>,
    markers: MarkerMatcher,
}

impl std::fmt::Debug for AuditEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditEngine")
            .field("markers", &self.markers)
            .finish_non_exhaustive()
    }
}

impl Default for AuditEngine {
    fn default() -> Self {
        Self::new(Arc::new(NeutralEvaluator))
    }
}

impl AuditEngine {
    #[must_use]
    pub fn new(evaluator: Arc<dyn SemanticEvaluator>) -> Self {
        Self {
            evaluator,
            markers: MarkerMatcher::default(),
        }
    }

    /// Override the completeness markers
    #[must_use]
    pub fn with_markers(mut self, markers: MarkerMatcher) -> Self {
        self.markers = markers;
        self
    }

    #[must_use]
    pub fn evaluator(&self) -> Arc<dyn SemanticEvaluator> {
        Arc::clone(&self.evaluator)
    }

    /// Deterministic rules only; synchronous and side-effect free
    ///
    /// `subjects` are the artifacts the state produced; `run_artifacts` is
    /// the full canonical set (including `subjects`) used for run-wide rules
    /// and reference resolution.
    #[must_use]
    pub fn evaluate_deterministic(
        &self,
        rules: &[Rule],
        subjects: &[Artifact],
        run_artifacts: &[Artifact],
    ) -> Vec<AuditResult> {
        let defined = checks::defined_ids(run_artifacts);
        let mut results = Vec::new();
        for rule in rules {
            match rule {
                Rule::Envelope => results.extend(subjects.iter().map(checks::check_envelope_rule)),
                Rule::Completeness => results.extend(
                    subjects
                        .iter()
                        .map(|a| checks::check_completeness(a, &self.markers)),
                ),
                Rule::DuplicateStableIds => {
                    results.extend(subjects.iter().map(checks::check_duplicate_ids));
                }
                Rule::ReferentialIntegrity => results.extend(
                    subjects
                        .iter()
                        .map(|a| checks::check_referential_integrity(a, &defined)),
                ),
                Rule::Consistency => results.push(checks::check_consistency(run_artifacts)),
                Rule::Traceability => results.push(checks::check_traceability(run_artifacts)),
            }
        }
        results
    }

    /// Score one semantic gate; evaluator errors become a failed result
    pub async fn evaluate_semantic(&self, gate: &SemanticGate, subjects: &[Artifact]) -> AuditResult {
        let evidence: Vec<Evidence> = subjects.iter().map(Evidence::of).collect();
        match self.evaluator.evaluate(&gate.rubric, subjects).await {
            Ok(score) => {
                let value = clamp_score(score.score);
                debug!(gate = %gate.name, score = value, "semantic gate scored");
                AuditResult::semantic(&gate.name, "run", value, gate.threshold, evidence)
                    .with_rationale(score.rationale)
                    .with_rubric_version(&gate.rubric.version)
            }
            Err(e) => {
                warn!(gate = %gate.name, error = %e, "semantic evaluator failed");
                AuditResult::semantic(&gate.name, "run", 0.0, gate.threshold, evidence)
                    .with_rationale(e.to_string())
                    .with_rubric_version(&gate.rubric.version)
            }
        }
    }

    /// All gates of one state
    pub async fn evaluate_state(
        &self,
        state: RunState,
        gates: &StateGates,
        subjects: &[Artifact],
        run_artifacts: &[Artifact],
    ) -> GateReport {
        let mut results = self.evaluate_deterministic(&gates.deterministic, subjects, run_artifacts);
        for gate in &gates.semantic {
            results.push(self.evaluate_semantic(gate, subjects).await);
        }
        let report = GateReport::new(state, results);
        debug!(
            state = %state,
            results = report.results.len(),
            passed = report.passed(),
            "evaluated state gates"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuditError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use specrun_artifact::{ArtifactType, RunId};

    fn artifact(t: ArtifactType, content: Value) -> Artifact {
        Artifact::builder(t, RunId::generate())
            .created_by("tester", "tester#0")
            .build(content)
    }

    struct FailingEvaluator;

    #[async_trait]
    impl SemanticEvaluator for FailingEvaluator {
        async fn evaluate(&self, _: &Rubric, _: &[Artifact]) -> Result<crate::SemanticScore, AuditError> {
            Err(AuditError::Evaluator("model unavailable".into()))
        }
    }

    #[tokio::test]
    async fn structural_gates_pass_clean_set() {
        let brief = artifact(ArtifactType::ProblemBrief, json!({"goals": [{"id": "OBJ-0001"}]}));
        let reqs = artifact(
            ArtifactType::BusinessRequirements,
            json!({"functional_requirements": [{"id": "REQ-0001", "objective": "OBJ-0001"}]}),
        );
        let all = vec![brief, reqs.clone()];
        let report = AuditEngine::default()
            .evaluate_state(RunState::Requirements, &StateGates::structural(), &[reqs], &all)
            .await;
        assert!(report.passed(), "{}", report.failure_summary());
        assert_eq!(report.results.len(), 4);
    }

    #[tokio::test]
    async fn evaluator_error_is_soft_failure() {
        let engine = AuditEngine::new(Arc::new(FailingEvaluator));
        let gates = StateGates::default().with_semantic(SemanticGate {
            name: "quality".into(),
            rubric: Rubric::new("quality", "v1"),
            threshold: 0.5,
        });
        let report = engine.evaluate_state(RunState::Review, &gates, &[], &[]).await;
        assert_eq!(report.hard_failures().count(), 0);
        assert_eq!(report.soft_failures().count(), 1);
        assert_eq!(report.results[0].rationale.as_deref(), Some("semantic evaluator failed: model unavailable"));
    }
}
