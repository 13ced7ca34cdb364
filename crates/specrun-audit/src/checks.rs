//! Deterministic audit rules
//!
//! Every rule is a pure function of the artifacts it is given and yields one
//! [`AuditResult`] per subject. Failures are hard gates.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specrun_artifact::{check_envelope, Artifact, ArtifactType, StableIds};

use crate::result::{AuditResult, Evidence};
use crate::traceability::TraceabilityMatrix;

/// Placeholder tokens that mark content as unfinished
pub const DEFAULT_MARKERS: [&str; 3] = ["TBD", "TODO", "TO_BE_DEFINED"];

/// Contradicting requirement pairs that need an explicit recorded tradeoff
pub const CONTRADICTIONS: [(&str, &str); 2] = [
    ("eventual consistency", "strong consistency"),
    ("single region only", "multi-region required"),
];

/// The deterministic rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    Envelope,
    Completeness,
    DuplicateStableIds,
    ReferentialIntegrity,
    Consistency,
    Traceability,
}

impl Rule {
    pub const ALL: [Self; 6] = [
        Self::Envelope,
        Self::Completeness,
        Self::DuplicateStableIds,
        Self::ReferentialIntegrity,
        Self::Consistency,
        Self::Traceability,
    ];

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Envelope => "envelope",
            Self::Completeness => "completeness",
            Self::DuplicateStableIds => "duplicate_stable_ids",
            Self::ReferentialIntegrity => "referential_integrity",
            Self::Consistency => "consistency",
            Self::Traceability => "traceability",
        }
    }

    /// Whether the rule looks at the whole run rather than one artifact
    #[must_use]
    pub const fn is_run_wide(self) -> bool {
        matches!(self, Self::Consistency | Self::Traceability)
    }
}

/// Every string leaf of a JSON tree
pub fn string_leaves(value: &Value) -> Vec<&str> {
    let mut out = Vec::new();
    collect_strings(value, &mut out);
    out
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Case-insensitive whole-word matcher for placeholder markers
#[derive(Debug, Clone)]
pub struct MarkerMatcher {
    patterns: Vec<(String, Regex)>,
}

impl MarkerMatcher {
    #[must_use]
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = markers
            .into_iter()
            .filter(|m| !m.as_ref().trim().is_empty())
            .filter_map(|m| {
                let marker = m.as_ref().trim().to_string();
                Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&marker)))
                    .ok()
                    .map(|re| (marker, re))
            })
            .collect();
        Self { patterns }
    }

    /// Distinct markers present in any of `texts`, in configured order
    #[must_use]
    pub fn find<'a, I>(&self, texts: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        self.patterns
            .iter()
            .filter(|(_, re)| texts.clone().into_iter().any(|t| re.is_match(t)))
            .map(|(marker, _)| marker.clone())
            .collect()
    }
}

impl Default for MarkerMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MARKERS)
    }
}

/// `envelope`: identity/provenance present, hash verifies, content fits its model
#[must_use]
pub fn check_envelope_rule(artifact: &Artifact) -> AuditResult {
    AuditResult::deterministic(
        Rule::Envelope.name(),
        artifact.artifact_id(),
        check_envelope(artifact),
        vec![Evidence::of(artifact)],
    )
}

/// `completeness`: no unresolved placeholder markers in content
#[must_use]
pub fn check_completeness(artifact: &Artifact, markers: &MarkerMatcher) -> AuditResult {
    let found = markers.find(string_leaves(&artifact.content));
    let messages = found
        .iter()
        .map(|m| format!("unresolved marker `{m}`"))
        .collect();
    AuditResult::deterministic(
        Rule::Completeness.name(),
        artifact.artifact_id(),
        messages,
        vec![Evidence::of(artifact)],
    )
}

/// `duplicate_stable_ids`: no stable ID defined twice within one artifact
#[must_use]
pub fn check_duplicate_ids(artifact: &Artifact) -> AuditResult {
    let ids = StableIds::extract(&artifact.content);
    let messages = ids
        .duplicates()
        .into_iter()
        .map(|id| format!("{id} defined more than once"))
        .collect();
    AuditResult::deterministic(
        Rule::DuplicateStableIds.name(),
        artifact.artifact_id(),
        messages,
        vec![Evidence::of(artifact)],
    )
}

/// Stable IDs defined by any artifact in `artifacts`
#[must_use]
pub fn defined_ids(artifacts: &[Artifact]) -> BTreeSet<String> {
    artifacts
        .iter()
        .flat_map(|a| {
            StableIds::extract(&a.content)
                .defined()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Referenced stable IDs of `artifact` that `defined` does not contain
#[must_use]
pub fn dangling_references(artifact: &Artifact, defined: &BTreeSet<String>) -> Vec<String> {
    StableIds::extract(&artifact.content)
        .referenced()
        .iter()
        .filter(|id| !defined.contains(*id))
        .cloned()
        .collect()
}

/// `referential_integrity`: every referenced stable ID is defined in the run
#[must_use]
pub fn check_referential_integrity(artifact: &Artifact, defined: &BTreeSet<String>) -> AuditResult {
    let messages = dangling_references(artifact, defined)
        .into_iter()
        .map(|id| format!("{id} is referenced but not defined in this run"))
        .collect();
    AuditResult::deterministic(
        Rule::ReferentialIntegrity.name(),
        artifact.artifact_id(),
        messages,
        vec![Evidence::of(artifact)],
    )
}

fn joined_text(artifacts: &[Artifact], types: &[ArtifactType]) -> String {
    artifacts
        .iter()
        .filter(|a| types.contains(&a.artifact_type()))
        .flat_map(|a| string_leaves(&a.content))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `consistency`: contradicting NFR pairs require a recorded tradeoff
#[must_use]
pub fn check_consistency(artifacts: &[Artifact]) -> AuditResult {
    let nfr_text = joined_text(
        artifacts,
        &[ArtifactType::NonFunctionalRequirements, ArtifactType::BusinessRequirements],
    );
    let tradeoff_text = joined_text(
        artifacts,
        &[ArtifactType::ArchitectureDecisionRecordSet, ArtifactType::TradeoffRegister],
    );
    let messages = CONTRADICTIONS
        .iter()
        .filter(|(left, right)| {
            nfr_text.contains(left) && nfr_text.contains(right) && !tradeoff_text.contains("tradeoff")
        })
        .map(|(left, right)| format!("`{left}` contradicts `{right}` with no recorded tradeoff"))
        .collect();
    let evidence = artifacts
        .iter()
        .filter(|a| a.artifact_type() == ArtifactType::NonFunctionalRequirements)
        .map(Evidence::of)
        .collect();
    AuditResult::deterministic(Rule::Consistency.name(), "run", messages, evidence)
}

/// `traceability`: every requirement row links to at least one column
#[must_use]
pub fn check_traceability(artifacts: &[Artifact]) -> AuditResult {
    let matrix = TraceabilityMatrix::build(artifacts);
    let messages = matrix
        .gaps()
        .iter()
        .map(|gap| format!("{} has no linked objective, decision, design, task or test", gap.row_id))
        .collect();
    let evidence = artifacts
        .iter()
        .filter(|a| {
            matches!(
                a.artifact_type(),
                ArtifactType::ImplementableSpec | ArtifactType::BusinessRequirements
            )
        })
        .map(Evidence::of)
        .collect();
    AuditResult::deterministic(Rule::Traceability.name(), "run", messages, evidence)
}
