//! Planning artifacts: problem framing, assumptions, sufficiency and amendments

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{record_id_problems, ArtifactContent, Record};
use crate::artifact_type::ArtifactType;

/// Problem statement and objectives (`OBJ-NNNN`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProblemBriefContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub goals: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for ProblemBriefContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::ProblemBrief;

    fn problems(&self) -> Vec<String> {
        record_id_problems("goals", &self.goals)
    }
}

/// Assumptions (`ASM-NNNN`) made to close gaps in the input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssumptionLedgerContent {
    pub assumptions: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for AssumptionLedgerContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::AssumptionLedger;

    fn problems(&self) -> Vec<String> {
        record_id_problems("assumptions", &self.assumptions)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TradeoffRegisterContent {
    pub tradeoffs: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for TradeoffRegisterContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::TradeoffRegister;
}

/// A missing-input descriptor surfaced to whoever answers clarifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingGap {
    pub area: String,
    pub description: String,
    pub suggested_question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<String>,
}

/// Outcome of the information-sufficiency gate, authored by the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfoSufficiencyAssessmentContent {
    pub confidence_score: Option<f64>,
    pub threshold: Option<f64>,
    pub passed: Option<bool>,
    pub input_size: Option<usize>,
    pub blocking_gaps: Vec<BlockingGap>,
    pub covered_topics: Vec<String>,
    pub missing_topics: Vec<String>,
    pub markers_found: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for InfoSufficiencyAssessmentContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::InfoSufficiencyAssessment;

    fn problems(&self) -> Vec<String> {
        match self.confidence_score {
            Some(score) if !(0.0..=1.0).contains(&score) => {
                vec![format!("confidence_score {score} outside [0, 1]")]
            }
            _ => Vec::new(),
        }
    }
}

/// One stable ID given a new value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmendedItem {
    pub id: String,
    pub value: Value,
}

/// A change request against a base run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AmendmentContent {
    pub base_run_id: String,
    #[serde(default)]
    pub amended_items: Vec<AmendedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for AmendmentContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::Amendment;

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.base_run_id.trim().is_empty() {
            problems.push("base_run_id must not be empty".to_string());
        }
        for (i, item) in self.amended_items.iter().enumerate() {
            if !crate::stable_id::is_stable_id(&item.id) {
                problems.push(format!(
                    "amended_items[{i}].id `{}` is not a stable ID",
                    item.id
                ));
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sufficiency_score_range_checked() {
        let content = InfoSufficiencyAssessmentContent {
            confidence_score: Some(1.5),
            ..Default::default()
        };
        assert_eq!(content.problems().len(), 1);
    }

    #[test]
    fn amendment_item_ids_must_be_stable_ids() {
        let content: AmendmentContent = serde_json::from_value(json!({
            "base_run_id": "20250101_000000_abcdef12",
            "amended_items": [{"id": "ASM-0001", "value": "x"}, {"id": "assumption one", "value": 1}]
        }))
        .unwrap();
        let problems = content.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("amended_items[1]"));
    }

    #[test]
    fn goal_ids_must_be_strings() {
        let content: ProblemBriefContent =
            serde_json::from_value(json!({"goals": [{"id": 7, "description": "x"}]})).unwrap();
        assert_eq!(content.problems(), vec!["goals[0].id must be a string".to_string()]);
    }
}
