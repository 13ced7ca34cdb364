//! Delivery artifacts: design, work breakdown, reviews, tests

use serde::{Deserialize, Serialize};

use super::{record_id_problems, ArtifactContent, Record};
use crate::artifact_type::ArtifactType;

/// Module-level design (`DES-NNNN`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImplementationDesignContent {
    pub modules: Vec<Record>,
    pub algorithms: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for ImplementationDesignContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::ImplementationDesign;

    fn problems(&self) -> Vec<String> {
        let mut problems = record_id_problems("modules", &self.modules);
        problems.extend(record_id_problems("algorithms", &self.algorithms));
        problems
    }
}

/// Tasks (`TASK-NNNN`) linked back to requirements
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkBreakdownContent {
    pub tasks: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for WorkBreakdownContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::WorkBreakdown;

    fn problems(&self) -> Vec<String> {
        record_id_problems("tasks", &self.tasks)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DesignReviewContent {
    pub findings: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for DesignReviewContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::DesignReview;

    fn problems(&self) -> Vec<String> {
        record_id_problems("findings", &self.findings)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CodeReviewContent {
    pub findings: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for CodeReviewContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::CodeReview;
}

/// Test suites (`TEST-NNNN`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TestPlanContent {
    pub test_suites: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for TestPlanContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::TestPlan;

    fn problems(&self) -> Vec<String> {
        record_id_problems("test_suites", &self.test_suites)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AcceptanceTestsContent {
    pub tests: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ArtifactContent for AcceptanceTestsContent {
    const ARTIFACT_TYPE: ArtifactType = ArtifactType::AcceptanceTests;

    fn problems(&self) -> Vec<String> {
        record_id_problems("tests", &self.tests)
    }
}
