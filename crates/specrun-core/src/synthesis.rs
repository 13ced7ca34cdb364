//! Multi-instance policies and candidate synthesis
//!
//! A role normally runs as one instance. Under enough ambiguity a configured
//! policy fans it out into several instances; their candidates are then
//! resolved into one canonical artifact, either by rubric score or by an
//! orchestrator-authored merge.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use specrun_artifact::Artifact;
use specrun_audit::{clamp_score, Rubric, SemanticEvaluator};
use tracing::warn;

/// How many instances run and how they interact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "pattern")]
pub enum InstancePattern {
    Single,
    /// Independent candidates
    Alternatives { count: usize },
    /// One draft, then `critics` critique passes over it
    GenerateAndCritique { critics: usize },
    /// `count` candidates, then one rebuttal round per instance
    Debate { count: usize },
}

impl InstancePattern {
    /// Instances in the final round; each yields one candidate
    #[must_use]
    pub fn candidate_count(self) -> usize {
        match self {
            Self::Single => 1,
            Self::Alternatives { count } | Self::Debate { count } => count.max(1),
            Self::GenerateAndCritique { critics } => critics.max(1),
        }
    }
}

/// How competing candidates become one canonical artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Highest semantic score wins; ties go to the lowest instance
    #[default]
    RubricScored,
    /// Union of list entries keyed by `id`
    Merge,
}

/// Per-role fan-out policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancePolicy {
    #[serde(flatten)]
    pub pattern: InstancePattern,
    /// Fan out only when ambiguity reaches this value
    #[serde(default)]
    pub min_ambiguity: f64,
    #[serde(default)]
    pub resolution: Resolution,
    #[serde(default = "default_rubric")]
    pub rubric: Rubric,
}

fn default_rubric() -> Rubric {
    Rubric::new("candidate_quality", "v1")
}

impl Default for InstancePolicy {
    fn default() -> Self {
        Self {
            pattern: InstancePattern::Single,
            min_ambiguity: 0.0,
            resolution: Resolution::RubricScored,
            rubric: default_rubric(),
        }
    }
}

impl InstancePolicy {
    #[must_use]
    pub fn new(pattern: InstancePattern) -> Self {
        Self {
            pattern,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_min_ambiguity(mut self, min_ambiguity: f64) -> Self {
        self.min_ambiguity = min_ambiguity;
        self
    }

    #[must_use]
    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Pattern to use at `ambiguity`
    #[must_use]
    pub fn select(&self, ambiguity: f64) -> InstancePattern {
        if ambiguity >= self.min_ambiguity {
            self.pattern
        } else {
            InstancePattern::Single
        }
    }
}

/// Index of the winning candidate
///
/// Evaluator failures score 0 for that candidate.
pub async fn rubric_scored(
    evaluator: &dyn SemanticEvaluator,
    rubric: &Rubric,
    candidates: &[Artifact],
) -> (usize, Vec<f64>) {
    let mut scores = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let score = match evaluator.evaluate(rubric, std::slice::from_ref(candidate)).await {
            Ok(score) => clamp_score(score.score),
            Err(e) => {
                warn!(candidate = %candidate.provenance.created_by_instance_id, error = %e, "candidate scoring failed");
                0.0
            }
        };
        scores.push(score);
    }
    let mut best = 0;
    for (i, score) in scores.iter().enumerate() {
        if *score > scores[best] {
            best = i;
        }
    }
    (best, scores)
}

/// Merge candidate contents
///
/// Array fields are unioned: entries with an `id` are kept once (first
/// candidate wins), entries without one are deduplicated by value. Scalar
/// and object fields come from the first candidate that has them.
#[must_use]
pub fn merge_contents(contents: &[Value]) -> Value {
    let mut merged = Map::new();
    for content in contents {
        let Value::Object(fields) = content else { continue };
        for (key, value) in fields {
            match (merged.get_mut(key), value) {
                (None, _) => {
                    merged.insert(key.clone(), value.clone());
                }
                (Some(Value::Array(existing)), Value::Array(incoming)) => {
                    merge_list(existing, incoming);
                }
                (Some(_), _) => {}
            }
        }
    }
    Value::Object(merged)
}

fn merge_list(existing: &mut Vec<Value>, incoming: &[Value]) {
    let mut ids: BTreeSet<String> = existing.iter().filter_map(entry_id).collect();
    for item in incoming {
        match entry_id(item) {
            Some(id) => {
                if ids.insert(id) {
                    existing.push(item.clone());
                }
            }
            None => {
                if !existing.contains(item) {
                    existing.push(item.clone());
                }
            }
        }
    }
}

fn entry_id(item: &Value) -> Option<String> {
    item.get("id").and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use specrun_artifact::{ArtifactType, RunId};
    use specrun_audit::{AuditError, SemanticScore};

    #[test]
    fn low_ambiguity_runs_single_instance() {
        let policy = InstancePolicy::new(InstancePattern::Alternatives { count: 3 }).with_min_ambiguity(0.4);
        assert_eq!(policy.select(0.1), InstancePattern::Single);
        assert_eq!(policy.select(0.4), InstancePattern::Alternatives { count: 3 });
    }

    #[test]
    fn policy_yaml_shape() {
        let policy: InstancePolicy = serde_yaml::from_str(
            "pattern: generate_and_critique\ncritics: 2\nmin_ambiguity: 0.3\nresolution: merge\n",
        )
        .unwrap();
        assert_eq!(policy.pattern, InstancePattern::GenerateAndCritique { critics: 2 });
        assert_eq!(policy.resolution, Resolution::Merge);
        assert_eq!(policy.rubric.name, "candidate_quality");
    }

    #[test]
    fn merge_unions_by_id_first_wins() {
        let merged = merge_contents(&[
            json!({"title": "A", "tasks": [{"id": "TASK-0001", "title": "first"}]}),
            json!({"title": "B", "tasks": [{"id": "TASK-0001", "title": "other"}, {"id": "TASK-0002"}], "notes": ["x"]}),
        ]);
        assert_eq!(
            merged,
            json!({
                "title": "A",
                "tasks": [{"id": "TASK-0001", "title": "first"}, {"id": "TASK-0002"}],
                "notes": ["x"]
            })
        );
    }

    struct ByLength;

    #[async_trait]
    impl SemanticEvaluator for ByLength {
        async fn evaluate(&self, _: &Rubric, artifacts: &[Artifact]) -> Result<SemanticScore, AuditError> {
            let len = artifacts[0].content["tasks"].as_array().map_or(0, Vec::len);
            if len == 0 {
                return Err(AuditError::Evaluator("empty".into()));
            }
            #[allow(clippy::cast_precision_loss)]
            Ok(SemanticScore {
                score: len as f64 / 10.0,
                rationale: String::new(),
                evidence_refs: vec![],
            })
        }
    }

    #[tokio::test]
    async fn rubric_scored_prefers_highest_then_lowest_index() {
        let run = RunId::generate();
        let candidate = |tasks: Value| {
            Artifact::builder(ArtifactType::WorkBreakdown, run.clone())
                .created_by("Planner", "Planner#0")
                .build(json!({ "tasks": tasks }))
        };
        let candidates = vec![
            candidate(json!([])),
            candidate(json!([{"id": "TASK-0001"}, {"id": "TASK-0002"}])),
            candidate(json!([{"id": "TASK-0003"}, {"id": "TASK-0004"}])),
        ];
        let (best, scores) = rubric_scored(&ByLength, &default_rubric(), &candidates).await;
        assert_eq!(best, 1);
        assert_eq!(scores, vec![0.0, 0.2, 0.2]);
    }
}
