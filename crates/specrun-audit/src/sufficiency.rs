//! Information-sufficiency gate
//!
//! Scores whether a feature description carries enough information to plan
//! from. Unlike other semantic gates its confidence is an explicit stop
//! condition.

use serde::{Deserialize, Serialize};
use specrun_artifact::types::{BlockingGap, InfoSufficiencyAssessmentContent};

use crate::checks::{MarkerMatcher, DEFAULT_MARKERS};
use crate::error::AuditError;
use crate::result::AuditResult;

/// Gate name used in audit results
pub const GATE_NAME: &str = "information_sufficiency";

/// A topic the input is expected to cover
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRubric {
    pub name: String,
    /// Any keyword (case-insensitive substring) counts as coverage
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

/// Thresholds and heuristics for the sufficiency gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SufficiencyPolicy {
    pub min_confidence_to_proceed: f64,
    /// Inputs shorter than this (in characters) are capped
    pub min_input_chars: usize,
    pub undersized_confidence_cap: f64,
    pub insufficient_markers: Vec<String>,
    /// Multiplier applied once per distinct marker found
    pub marker_penalty: f64,
    pub topics: Vec<TopicRubric>,
}

impl Default for SufficiencyPolicy {
    fn default() -> Self {
        Self {
            min_confidence_to_proceed: 0.6,
            min_input_chars: 40,
            undersized_confidence_cap: 0.3,
            insufficient_markers: DEFAULT_MARKERS.iter().map(|m| (*m).to_string()).collect(),
            marker_penalty: 0.25,
            topics: Vec::new(),
        }
    }
}

/// Result of assessing one input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SufficiencyAssessment {
    pub confidence_score: f64,
    pub threshold: f64,
    pub input_size: usize,
    pub blocking_gaps: Vec<BlockingGap>,
    pub covered_topics: Vec<String>,
    pub missing_topics: Vec<String>,
    pub markers_found: Vec<String>,
}

impl SufficiencyAssessment {
    #[inline]
    #[must_use]
    pub fn passed(&self) -> bool {
        self.confidence_score >= self.threshold
    }

    /// `1 - confidence`; drives multi-instance policy selection
    #[inline]
    #[must_use]
    pub fn ambiguity(&self) -> f64 {
        1.0 - self.confidence_score
    }

    /// Semantic audit result for this assessment
    #[must_use]
    pub fn to_audit_result(&self) -> AuditResult {
        AuditResult::semantic(GATE_NAME, "run", self.confidence_score, self.threshold, Vec::new())
            .with_gaps(self.blocking_gaps.clone())
    }

    /// Content of the InfoSufficiencyAssessment artifact
    #[must_use]
    pub fn to_content(&self) -> InfoSufficiencyAssessmentContent {
        InfoSufficiencyAssessmentContent {
            confidence_score: Some(self.confidence_score),
            threshold: Some(self.threshold),
            passed: Some(self.passed()),
            input_size: Some(self.input_size),
            blocking_gaps: self.blocking_gaps.clone(),
            covered_topics: self.covered_topics.clone(),
            missing_topics: self.missing_topics.clone(),
            markers_found: self.markers_found.clone(),
            raw_response: None,
        }
    }

    /// Rebuild from a persisted assessment artifact
    #[must_use]
    pub fn from_content(content: &InfoSufficiencyAssessmentContent, threshold: f64) -> Self {
        Self {
            confidence_score: content.confidence_score.unwrap_or(0.0),
            threshold,
            input_size: content.input_size.unwrap_or(0),
            blocking_gaps: content.blocking_gaps.clone(),
            covered_topics: content.covered_topics.clone(),
            missing_topics: content.missing_topics.clone(),
            markers_found: content.markers_found.clone(),
        }
    }
}

impl SufficiencyPolicy {
    /// Reject out-of-range values
    ///
    /// # Errors
    /// [`AuditError::InvalidPolicy`] naming the offending field
    pub fn validate(&self) -> Result<(), AuditError> {
        for (name, value) in [
            ("min_confidence_to_proceed", self.min_confidence_to_proceed),
            ("undersized_confidence_cap", self.undersized_confidence_cap),
            ("marker_penalty", self.marker_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AuditError::InvalidPolicy(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        if let Some(topic) = self.topics.iter().find(|t| t.keywords.is_empty()) {
            return Err(AuditError::InvalidPolicy(format!("topic `{}` has no keywords", topic.name)));
        }
        Ok(())
    }

    /// Score `input`
    ///
    /// Base confidence is the covered share of configured topics (1.0 with
    /// none). Undersized input is capped at `undersized_confidence_cap`;
    /// each distinct marker multiplies by `marker_penalty`.
    #[must_use]
    pub fn assess(&self, input: &str) -> SufficiencyAssessment {
        let input_size = input.chars().count();
        let lowered = input.to_lowercase();
        let mut blocking_gaps = Vec::new();

        let (covered_topics, missing_topics): (Vec<&TopicRubric>, Vec<&TopicRubric>) = self
            .topics
            .iter()
            .partition(|t| t.keywords.iter().any(|k| lowered.contains(&k.to_lowercase())));
        #[allow(clippy::cast_precision_loss)]
        let mut confidence = if self.topics.is_empty() {
            1.0
        } else {
            covered_topics.len() as f64 / self.topics.len() as f64
        };
        for topic in &missing_topics {
            blocking_gaps.push(BlockingGap {
                area: topic.name.clone(),
                description: format!("Input does not cover {}.", topic.name),
                suggested_question: topic
                    .question
                    .clone()
                    .unwrap_or_else(|| format!("Can you describe the expected {}?", topic.name)),
                markers: Vec::new(),
            });
        }

        if input_size < self.min_input_chars {
            confidence = confidence.min(self.undersized_confidence_cap);
            blocking_gaps.push(BlockingGap {
                area: "scope".to_string(),
                description: "Description is too short for implementation planning.".to_string(),
                suggested_question: "What are the key goals, constraints, and acceptance criteria?"
                    .to_string(),
                markers: Vec::new(),
            });
        }

        let markers_found = MarkerMatcher::new(&self.insufficient_markers).find([input]);
        if !markers_found.is_empty() {
            let exponent = i32::try_from(markers_found.len()).unwrap_or(i32::MAX);
            confidence *= self.marker_penalty.powi(exponent);
            blocking_gaps.push(BlockingGap {
                area: "unknowns".to_string(),
                description: "Input contains unresolved placeholders.".to_string(),
                suggested_question: "Can you resolve placeholders before planning?".to_string(),
                markers: markers_found.clone(),
            });
        }

        SufficiencyAssessment {
            confidence_score: confidence.clamp(0.0, 1.0),
            threshold: self.min_confidence_to_proceed,
            input_size,
            blocking_gaps,
            covered_topics: covered_topics.iter().map(|t| t.name.clone()).collect(),
            missing_topics: missing_topics.iter().map(|t| t.name.clone()).collect(),
            markers_found,
        }
    }
}
