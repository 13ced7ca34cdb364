//! Artifact type catalog
//!
//! The closed set of document kinds a run can hold. Each variant maps to a
//! typed content model in [`crate::types`]; content is validated against
//! that model before it is ever written.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{self, ArtifactContent};

/// Supported artifact types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ArtifactType {
    ProblemBrief,
    BusinessRequirements,
    NonFunctionalRequirements,
    C4Model,
    ArchitectureDecisionRecordSet,
    TechStackRecommendation,
    AssumptionLedger,
    TradeoffRegister,
    InfoSufficiencyAssessment,
    TraceabilityMatrix,
    ImplementableSpec,
    ImplementationDesign,
    WorkBreakdown,
    DesignReview,
    CodeReview,
    ThreatModel,
    PrivacyChecklist,
    TestPlan,
    AcceptanceTests,
    Amendment,
}

impl ArtifactType {
    /// Every variant, in catalog order
    pub const ALL: [Self; 20] = [
        Self::ProblemBrief,
        Self::BusinessRequirements,
        Self::NonFunctionalRequirements,
        Self::C4Model,
        Self::ArchitectureDecisionRecordSet,
        Self::TechStackRecommendation,
        Self::AssumptionLedger,
        Self::TradeoffRegister,
        Self::InfoSufficiencyAssessment,
        Self::TraceabilityMatrix,
        Self::ImplementableSpec,
        Self::ImplementationDesign,
        Self::WorkBreakdown,
        Self::DesignReview,
        Self::CodeReview,
        Self::ThreatModel,
        Self::PrivacyChecklist,
        Self::TestPlan,
        Self::AcceptanceTests,
        Self::Amendment,
    ];

    /// Wire and file name of this type
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProblemBrief => "ProblemBrief",
            Self::BusinessRequirements => "BusinessRequirements",
            Self::NonFunctionalRequirements => "NonFunctionalRequirements",
            Self::C4Model => "C4Model",
            Self::ArchitectureDecisionRecordSet => "ArchitectureDecisionRecordSet",
            Self::TechStackRecommendation => "TechStackRecommendation",
            Self::AssumptionLedger => "AssumptionLedger",
            Self::TradeoffRegister => "TradeoffRegister",
            Self::InfoSufficiencyAssessment => "InfoSufficiencyAssessment",
            Self::TraceabilityMatrix => "TraceabilityMatrix",
            Self::ImplementableSpec => "ImplementableSpec",
            Self::ImplementationDesign => "ImplementationDesign",
            Self::WorkBreakdown => "WorkBreakdown",
            Self::DesignReview => "DesignReview",
            Self::CodeReview => "CodeReview",
            Self::ThreatModel => "ThreatModel",
            Self::PrivacyChecklist => "PrivacyChecklist",
            Self::TestPlan => "TestPlan",
            Self::AcceptanceTests => "AcceptanceTests",
            Self::Amendment => "Amendment",
        }
    }

    /// Validate `content` against this type's content model
    ///
    /// # Errors
    /// Returns one message per structural problem found
    pub fn validate_content(self, content: &Value) -> Result<(), Vec<String>> {
        if !content.is_object() {
            return Err(vec![format!(
                "{self} content must be a JSON object, got {}",
                json_kind(content)
            )]);
        }
        match self {
            Self::ProblemBrief => check::<types::ProblemBriefContent>(content),
            Self::BusinessRequirements => check::<types::BusinessRequirementsContent>(content),
            Self::NonFunctionalRequirements => {
                check::<types::NonFunctionalRequirementsContent>(content)
            }
            Self::C4Model => check::<types::C4ModelContent>(content),
            Self::ArchitectureDecisionRecordSet => {
                check::<types::ArchitectureDecisionRecordSetContent>(content)
            }
            Self::TechStackRecommendation => check::<types::TechStackRecommendationContent>(content),
            Self::AssumptionLedger => check::<types::AssumptionLedgerContent>(content),
            Self::TradeoffRegister => check::<types::TradeoffRegisterContent>(content),
            Self::InfoSufficiencyAssessment => {
                check::<types::InfoSufficiencyAssessmentContent>(content)
            }
            Self::TraceabilityMatrix => check::<types::TraceabilityMatrixContent>(content),
            Self::ImplementableSpec => check::<types::ImplementableSpecContent>(content),
            Self::ImplementationDesign => check::<types::ImplementationDesignContent>(content),
            Self::WorkBreakdown => check::<types::WorkBreakdownContent>(content),
            Self::DesignReview => check::<types::DesignReviewContent>(content),
            Self::CodeReview => check::<types::CodeReviewContent>(content),
            Self::ThreatModel => check::<types::ThreatModelContent>(content),
            Self::PrivacyChecklist => check::<types::PrivacyChecklistContent>(content),
            Self::TestPlan => check::<types::TestPlanContent>(content),
            Self::AcceptanceTests => check::<types::AcceptanceTestsContent>(content),
            Self::Amendment => check::<types::AmendmentContent>(content),
        }
    }
}

fn check<T: ArtifactContent>(content: &Value) -> Result<(), Vec<String>> {
    let parsed: T = serde_json::from_value(content.clone()).map_err(|e| vec![e.to_string()])?;
    let problems = parsed.problems();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl Display for ArtifactType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactType {
    type Err = UnknownArtifactType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownArtifactType(s.to_string()))
    }
}

/// Unrecognized artifact type name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown artifact type: {0}")]
pub struct UnknownArtifactType(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_round_trip_through_from_str() {
        for t in ArtifactType::ALL {
            assert_eq!(t.as_str().parse::<ArtifactType>().unwrap(), t);
            assert_eq!(serde_json::to_value(t).unwrap(), json!(t.as_str()));
        }
    }

    #[test]
    fn unknown_name_rejected() {
        assert_eq!(
            "Sprint".parse::<ArtifactType>(),
            Err(UnknownArtifactType("Sprint".into()))
        );
    }

    #[test]
    fn non_object_content_rejected() {
        let err = ArtifactType::ProblemBrief
            .validate_content(&json!("free text"))
            .unwrap_err();
        assert!(err[0].contains("must be a JSON object"));
    }

    #[test]
    fn unknown_field_rejected() {
        let err = ArtifactType::WorkBreakdown
            .validate_content(&json!({"tasks": [], "sprints": []}))
            .unwrap_err();
        assert!(err[0].contains("sprints"));
    }

    #[test]
    fn raw_response_allowed_everywhere() {
        for t in ArtifactType::ALL {
            if t == ArtifactType::Amendment {
                continue;
            }
            assert!(
                t.validate_content(&json!({"raw_response": "text"})).is_ok(),
                "{t} rejected raw_response"
            );
        }
    }

    #[test]
    fn amendment_requires_base_run() {
        let err = ArtifactType::Amendment
            .validate_content(&json!({"amended_items": []}))
            .unwrap_err();
        assert!(err[0].contains("base_run_id"));
    }
}
