//! Architecture artifacts

use serde::{Deserialize, Serialize};

use super::{record_id_problems, ArtifactContent, Record};
use crate::artifact_type::ArtifactType;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct C4ModelContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plantuml_source: Option<String>,
    pub diagrams: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for C4ModelContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::C4Model;

    fn problems(&self) -> Vec<String> {
        record_id_problems("diagrams", &self.diagrams)
    }
}

/// Architecture decisions (`ADR-NNNN`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchitectureDecisionRecordSetContent {
    pub decisions: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for ArchitectureDecisionRecordSetContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::ArchitectureDecisionRecordSet;

    fn problems(&self) -> Vec<String> {
        record_id_problems("decisions", &self.decisions)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TechStackRecommendationContent {
    pub stack: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for TechStackRecommendationContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::TechStackRecommendation;

    fn problems(&self) -> Vec<String> {
        record_id_problems("stack", &self.stack)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ThreatModelContent {
    pub threats: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for ThreatModelContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::ThreatModel;

    fn problems(&self) -> Vec<String> {
        record_id_problems("threats", &self.threats)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrivacyChecklistContent {
    pub checks: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for PrivacyChecklistContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::PrivacyChecklist;
}
