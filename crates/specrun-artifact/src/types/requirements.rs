//! Requirement artifacts

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{record_id_problems, ArtifactContent, Record};
use crate::artifact_type::ArtifactType;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusinessRequirementsContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub functional_requirements: Vec<Record>,
    pub non_functional_requirements: Vec<Record>,
    pub resources: Record,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for BusinessRequirementsContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::BusinessRequirements;

    fn problems(&self) -> Vec<String> {
        let mut problems = record_id_problems("functional_requirements", &self.functional_requirements);
        problems.extend(record_id_problems(
            "non_functional_requirements",
            &self.non_functional_requirements,
        ));
        problems
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NonFunctionalRequirementsContent {
    pub categories: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for NonFunctionalRequirementsContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::NonFunctionalRequirements;

    fn problems(&self) -> Vec<String> {
        record_id_problems("categories", &self.categories)
    }
}

/// Implementation-ready requirements; the rows of the traceability matrix
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImplementableSpecContent {
    pub requirements: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for ImplementableSpecContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::ImplementableSpec;

    fn problems(&self) -> Vec<String> {
        record_id_problems("requirements", &self.requirements)
    }
}

/// A requirement row with no linked column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceGap {
    pub row_id: String,
    pub severity: String,
}

/// Requirement-to-work cross tabulation
///
/// `cells` is keyed `"<row>|<column>"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TraceabilityMatrixContent {
    pub rows: Vec<String>,
    pub columns: Vec<String>,
    pub cells: BTreeMap<String, Vec<String>>,
    pub gaps: Vec<TraceGap>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for TraceabilityMatrixContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::TraceabilityMatrix;

    fn problems(&self) -> Vec<String> {
        self.cells
            .keys()
            .filter(|key| !key.contains('|'))
            .map(|key| format!("cell key `{key}` is not `<row>|<column>`"))
            .collect()
    }
}
