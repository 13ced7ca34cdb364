//! Artifact content models
//!
//! One struct per [`ArtifactType`](crate::ArtifactType). Every model
//! rejects unknown fields and accepts an optional `raw_response`, which
//! carries the untouched executor output alongside the structured fields.
//!
//! - planning: problem framing, assumptions, sufficiency, amendments
//! - requirements: business/non-functional requirements and the implementable spec
//! - architecture: C4 views, decisions, stack, threat and privacy reviews
//! - delivery: design, work breakdown, reviews and tests

pub mod architecture;
pub mod delivery;
pub mod planning;
pub mod requirements;

pub use architecture::{
    ArchitectureDecisionRecordSetContent, C4ModelContent, PrivacyChecklistContent,
    TechStackRecommendationContent, ThreatModelContent,
};
pub use delivery::{
    AcceptanceTestsContent, CodeReviewContent, DesignReviewContent, ImplementationDesignContent,
    TestPlanContent, WorkBreakdownContent,
};
pub use planning::{
    AmendedItem, AmendmentContent, AssumptionLedgerContent, BlockingGap,
    InfoSufficiencyAssessmentContent, ProblemBriefContent, TradeoffRegisterContent,
};
pub use requirements::{
    BusinessRequirementsContent, ImplementableSpecContent, NonFunctionalRequirementsContent,
    TraceGap, TraceabilityMatrixContent,
};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::artifact_type::ArtifactType;

/// A structured list entry (goal, requirement, decision, task, ...)
///
/// Entries are JSON objects; an entry's `id` key, when present, defines a
/// stable ID such as `REQ-0001`.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Typed content of one artifact type
pub trait ArtifactContent: Serialize + DeserializeOwned {
    /// The catalog entry this model belongs to
    const ARTIFACT_TYPE: ArtifactType;

    /// Semantic problems serde cannot express (empty when valid)
    fn problems(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Entries whose `id` is present but not a string
pub(crate) fn record_id_problems(field: &str, records: &[Record]) -> Vec<String> {
    records
        .iter()
        .enumerate()
        .filter(|(_, r)| r.get("id").is_some_and(|id| !id.is_string()))
        .map(|(i, _)| format!("{field}[{i}].id must be a string"))
        .collect()
}
