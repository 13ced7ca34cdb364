//! Role catalog
//!
//! A closed set of roles. Each role produces exactly one artifact type and
//! declares which artifact types it reads by default; configuration may
//! narrow or widen those inputs but never invents new roles.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use specrun_artifact::ArtifactType;

/// A generator of one artifact type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Role {
    IntakeAnalyst,
    Clarifier,
    BusinessAnalyst,
    NfrAnalyst,
    TradeoffAnalyst,
    Architect,
    C4Modeler,
    TechAdvisor,
    SecurityAnalyst,
    PrivacyAnalyst,
    SpecWriter,
    Designer,
    Planner,
    TestPlanner,
    AcceptanceTester,
    Reviewer,
    CodeReviewer,
}

impl Role {
    pub const ALL: [Self; 17] = [
        Self::IntakeAnalyst,
        Self::Clarifier,
        Self::BusinessAnalyst,
        Self::NfrAnalyst,
        Self::TradeoffAnalyst,
        Self::Architect,
        Self::C4Modeler,
        Self::TechAdvisor,
        Self::SecurityAnalyst,
        Self::PrivacyAnalyst,
        Self::SpecWriter,
        Self::Designer,
        Self::Planner,
        Self::TestPlanner,
        Self::AcceptanceTester,
        Self::Reviewer,
        Self::CodeReviewer,
    ];

    /// The artifact type this role produces
    #[must_use]
    pub const fn output(self) -> ArtifactType {
        match self {
            Self::IntakeAnalyst => ArtifactType::ProblemBrief,
            Self::Clarifier => ArtifactType::AssumptionLedger,
            Self::BusinessAnalyst => ArtifactType::BusinessRequirements,
            Self::NfrAnalyst => ArtifactType::NonFunctionalRequirements,
            Self::TradeoffAnalyst => ArtifactType::TradeoffRegister,
            Self::Architect => ArtifactType::ArchitectureDecisionRecordSet,
            Self::C4Modeler => ArtifactType::C4Model,
            Self::TechAdvisor => ArtifactType::TechStackRecommendation,
            Self::SecurityAnalyst => ArtifactType::ThreatModel,
            Self::PrivacyAnalyst => ArtifactType::PrivacyChecklist,
            Self::SpecWriter => ArtifactType::ImplementableSpec,
            Self::Designer => ArtifactType::ImplementationDesign,
            Self::Planner => ArtifactType::WorkBreakdown,
            Self::TestPlanner => ArtifactType::TestPlan,
            Self::AcceptanceTester => ArtifactType::AcceptanceTests,
            Self::Reviewer => ArtifactType::DesignReview,
            Self::CodeReviewer => ArtifactType::CodeReview,
        }
    }

    /// Artifact types read when configuration does not override them
    #[must_use]
    pub const fn default_inputs(self) -> &'static [ArtifactType] {
        use ArtifactType as T;
        match self {
            Self::IntakeAnalyst => &[],
            Self::Clarifier => &[T::ProblemBrief, T::InfoSufficiencyAssessment],
            Self::BusinessAnalyst | Self::NfrAnalyst => &[T::ProblemBrief, T::AssumptionLedger],
            Self::TradeoffAnalyst => &[T::BusinessRequirements, T::NonFunctionalRequirements],
            Self::Architect => &[T::BusinessRequirements, T::NonFunctionalRequirements],
            Self::C4Modeler => &[T::BusinessRequirements, T::ArchitectureDecisionRecordSet],
            Self::TechAdvisor => &[T::NonFunctionalRequirements, T::ArchitectureDecisionRecordSet],
            Self::SecurityAnalyst | Self::PrivacyAnalyst => {
                &[T::BusinessRequirements, T::ArchitectureDecisionRecordSet]
            }
            Self::SpecWriter => &[
                T::BusinessRequirements,
                T::NonFunctionalRequirements,
                T::ArchitectureDecisionRecordSet,
            ],
            Self::Designer => &[T::ImplementableSpec, T::ArchitectureDecisionRecordSet],
            Self::Planner => &[T::ImplementableSpec, T::ImplementationDesign],
            Self::TestPlanner | Self::AcceptanceTester => &[T::ImplementableSpec],
            Self::Reviewer => &[
                T::ImplementableSpec,
                T::ImplementationDesign,
                T::WorkBreakdown,
                T::TestPlan,
            ],
            Self::CodeReviewer => &[T::ImplementationDesign, T::WorkBreakdown],
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IntakeAnalyst => "IntakeAnalyst",
            Self::Clarifier => "Clarifier",
            Self::BusinessAnalyst => "BusinessAnalyst",
            Self::NfrAnalyst => "NfrAnalyst",
            Self::TradeoffAnalyst => "TradeoffAnalyst",
            Self::Architect => "Architect",
            Self::C4Modeler => "C4Modeler",
            Self::TechAdvisor => "TechAdvisor",
            Self::SecurityAnalyst => "SecurityAnalyst",
            Self::PrivacyAnalyst => "PrivacyAnalyst",
            Self::SpecWriter => "SpecWriter",
            Self::Designer => "Designer",
            Self::Planner => "Planner",
            Self::TestPlanner => "TestPlanner",
            Self::AcceptanceTester => "AcceptanceTester",
            Self::Reviewer => "Reviewer",
            Self::CodeReviewer => "CodeReviewer",
        }
    }

    /// Role producing `artifact_type`, if any
    #[must_use]
    pub fn producing(artifact_type: ArtifactType) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.output() == artifact_type)
    }

    /// Instance identifier, e.g. `Architect#1`
    #[must_use]
    pub fn instance_id(self, index: usize) -> String {
        format!("{}#{index}", self.as_str())
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown role name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownRole(s.to_string()))
    }
}
