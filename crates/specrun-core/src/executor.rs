//! Role executor seam
//!
//! The orchestrator never produces content itself. It hands a
//! [`RoleRequest`] to whatever [`RoleExecutor`] the [`ExecutorRegistry`]
//! resolves for the role and wraps the returned content into an artifact.
//! Language-model backends live outside this crate; the only executor
//! shipped here is [`DryRunExecutor`], which emits deterministic,
//! structurally valid content for every role.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use specrun_artifact::types::{AmendmentContent, BlockingGap};
use specrun_artifact::{Artifact, ArtifactType, ModelRef, QualityMetadata, RunId, StableIds};

use crate::error::ExecutorError;
use crate::role::Role;

/// How an instance participates in a multi-instance step
#[derive(Debug, Clone, PartialEq, Default)]
pub enum InstanceMode {
    /// Produce a candidate from the inputs
    #[default]
    Generate,
    /// Review `draft` and return an improved candidate
    Critique { draft: Value },
    /// Second debate round: answer the other instances' candidates
    Rebut { peers: Vec<Value> },
}

/// Everything an executor may read for one invocation
#[derive(Debug, Clone)]
pub struct RoleRequest {
    pub run_id: RunId,
    pub role: Role,
    pub instance_index: usize,
    /// `Role#index`
    pub instance_id: String,
    pub mode: InstanceMode,
    /// Feature description, including clarification answers and amendments
    pub pipeline_input: String,
    /// Canonical artifacts of the role's declared input types
    pub inputs: Vec<Artifact>,
    /// Current canonical artifact when this is a revision
    pub previous: Option<Artifact>,
    /// Gate messages that triggered the revision
    pub feedback: Vec<String>,
    /// Open sufficiency gaps; set for clarification rounds
    pub blocking_gaps: Vec<BlockingGap>,
    pub amendment: Option<AmendmentContent>,
}

impl RoleRequest {
    #[must_use]
    pub fn new(run_id: RunId, role: Role, pipeline_input: impl Into<String>) -> Self {
        Self {
            run_id,
            role,
            instance_index: 0,
            instance_id: role.instance_id(0),
            mode: InstanceMode::Generate,
            pipeline_input: pipeline_input.into(),
            inputs: Vec::new(),
            previous: None,
            feedback: Vec::new(),
            blocking_gaps: Vec::new(),
            amendment: None,
        }
    }

    #[must_use]
    pub fn with_inputs(mut self, inputs: Vec<Artifact>) -> Self {
        self.inputs = inputs;
        self
    }

    #[must_use]
    pub fn with_instance(mut self, index: usize, mode: InstanceMode) -> Self {
        self.instance_index = index;
        self.instance_id = self.role.instance_id(index);
        self.mode = mode;
        self
    }

    /// Input artifact of `artifact_type`, if supplied
    #[must_use]
    pub fn input(&self, artifact_type: ArtifactType) -> Option<&Artifact> {
        self.inputs.iter().find(|a| a.artifact_type() == artifact_type)
    }

    /// Stable IDs defined by the inputs, sorted
    #[must_use]
    pub fn upstream_ids(&self) -> Vec<String> {
        let ids: BTreeSet<String> = self
            .inputs
            .iter()
            .flat_map(|a| {
                StableIds::extract(&a.content)
                    .defined()
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .collect();
        ids.into_iter().collect()
    }
}

/// Content returned by an executor
#[derive(Debug, Clone, PartialEq)]
pub struct RoleOutput {
    pub content: Value,
    pub model_ref: ModelRef,
    pub quality: QualityMetadata,
}

impl RoleOutput {
    #[must_use]
    pub fn new(content: Value, model_ref: ModelRef) -> Self {
        Self {
            content,
            model_ref,
            quality: QualityMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_quality(mut self, quality: QualityMetadata) -> Self {
        self.quality = quality;
        self
    }
}

/// Produces content for a role
#[async_trait]
pub trait RoleExecutor: Send + Sync {
    /// Invoke the role once
    ///
    /// # Errors
    /// [`ExecutorError::Retryable`] for throttling, [`ExecutorError::Fatal`]
    /// for anything a retry cannot fix
    async fn invoke(&self, request: &RoleRequest) -> Result<RoleOutput, ExecutorError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "executor"
    }
}

/// Static role -> executor mapping resolved once at run start
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    default: Option<Arc<dyn RoleExecutor>>,
    per_role: HashMap<Role, Arc<dyn RoleExecutor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut roles: Vec<&Role> = self.per_role.keys().collect();
        roles.sort();
        f.debug_struct("ExecutorRegistry")
            .field("default", &self.default.as_ref().map(|e| e.name().to_string()))
            .field("per_role", &roles)
            .finish()
    }
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that answers every role with [`DryRunExecutor`]
    #[must_use]
    pub fn dry_run() -> Self {
        Self::new().with_default(Arc::new(DryRunExecutor))
    }

    /// Fallback for roles without a dedicated executor
    #[must_use]
    pub fn with_default(mut self, executor: Arc<dyn RoleExecutor>) -> Self {
        self.default = Some(executor);
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: Role, executor: Arc<dyn RoleExecutor>) -> Self {
        self.per_role.insert(role, executor);
        self
    }

    pub fn register(&mut self, role: Role, executor: Arc<dyn RoleExecutor>) {
        self.per_role.insert(role, executor);
    }

    #[must_use]
    pub fn resolve(&self, role: Role) -> Option<Arc<dyn RoleExecutor>> {
        self.per_role.get(&role).or(self.default.as_ref()).cloned()
    }
}

/// Deterministic offline executor
///
/// Each role defines one stable ID of its own prefix and references every
/// ID its inputs define, so a full pipeline passes all deterministic gates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

impl DryRunExecutor {
    pub const PROVIDER: &'static str = "dry-run";

    /// Stable ID a role defines
    #[must_use]
    pub const fn defined_id(role: Role) -> &'static str {
        match role {
            Role::IntakeAnalyst => "OBJ-0001",
            Role::Clarifier => "ASM-0001",
            Role::BusinessAnalyst | Role::SpecWriter => "REQ-0001",
            Role::NfrAnalyst => "NFR-0001",
            Role::TradeoffAnalyst => "TRD-0001",
            Role::Architect => "ADR-0001",
            Role::C4Modeler => "CTX-0001",
            Role::TechAdvisor => "STK-0001",
            Role::SecurityAnalyst => "THR-0001",
            Role::PrivacyAnalyst => "PRV-0001",
            Role::Designer => "DES-0001",
            Role::Planner => "TASK-0001",
            Role::TestPlanner | Role::AcceptanceTester => "TEST-0001",
            Role::Reviewer | Role::CodeReviewer => "REV-0001",
        }
    }

    /// Content for `request`, always valid for the role's output type
    #[must_use]
    pub fn content_for(request: &RoleRequest) -> Value {
        let role = request.role;
        let id = Self::defined_id(role);
        let mut traces = request.upstream_ids();
        traces.retain(|t| t != id);
        let item = |extra: Value| -> Value {
            let mut record = json!({"id": id, "traces": traces});
            if let (Some(record), Value::Object(extra)) = (record.as_object_mut(), extra) {
                record.extend(extra);
            }
            record
        };
        match role {
            Role::IntakeAnalyst => json!({
                "title": "Dry-run problem brief",
                "summary": format!("Offline brief over {} characters of input", request.pipeline_input.chars().count()),
                "goals": [item(json!({"statement": "Deliver the described capability"}))],
            }),
            Role::Clarifier => {
                let mut assumptions: Vec<Value> = request
                    .blocking_gaps
                    .iter()
                    .enumerate()
                    .map(|(i, gap)| {
                        json!({
                            "id": format!("ASM-{:04}", i + 2),
                            "area": gap.area,
                            "statement": format!("Standard expectations apply for {}", gap.area),
                        })
                    })
                    .collect();
                assumptions.insert(0, item(json!({"statement": "Conventional defaults apply"})));
                json!({ "assumptions": assumptions })
            }
            Role::BusinessAnalyst => json!({
                "title": "Dry-run business requirements",
                "functional_requirements": [item(json!({"statement": "The system supports the primary workflow"}))],
                "non_functional_requirements": [],
                "resources": {},
            }),
            Role::NfrAnalyst => json!({
                "categories": [item(json!({"name": "reliability", "statement": "Operations complete without data loss"}))],
            }),
            Role::TradeoffAnalyst => json!({
                "tradeoffs": [item(json!({"title": "Simplicity over throughput"}))],
            }),
            Role::Architect => json!({
                "decisions": [item(json!({"title": "Single deployable service", "status": "accepted"}))],
            }),
            Role::C4Modeler => json!({
                "plantuml_source": "@startuml\nSystem(app, \"Application\")\n@enduml",
                "diagrams": [item(json!({"level": "context"}))],
            }),
            Role::TechAdvisor => json!({
                "stack": [item(json!({"component": "storage", "choice": "relational database"}))],
            }),
            Role::SecurityAnalyst => json!({
                "threats": [item(json!({"category": "spoofing", "mitigation": "authenticated sessions"}))],
            }),
            Role::PrivacyAnalyst => json!({
                "checks": [item(json!({"item": "personal data inventory", "status": "covered"}))],
            }),
            Role::SpecWriter => json!({
                "requirements": [item(json!({"statement": "Implement the primary workflow end to end"}))],
            }),
            Role::Designer => json!({
                "modules": [item(json!({"name": "core"}))],
                "algorithms": [],
            }),
            Role::Planner => json!({
                "tasks": [item(json!({"title": "Implement core module"}))],
            }),
            Role::TestPlanner => json!({
                "test_suites": [item(json!({"name": "workflow acceptance"}))],
            }),
            Role::AcceptanceTester => json!({
                "tests": [item(json!({"scenario": "primary workflow succeeds"}))],
            }),
            Role::Reviewer => json!({
                "findings": [item(json!({"severity": "info", "note": "Design covers every requirement"}))],
                "verdict": "approved",
            }),
            Role::CodeReviewer => json!({
                "findings": [item(json!({"severity": "info", "note": "No blocking issues"}))],
            }),
        }
    }
}

#[async_trait]
impl RoleExecutor for DryRunExecutor {
    async fn invoke(&self, request: &RoleRequest) -> Result<RoleOutput, ExecutorError> {
        Ok(RoleOutput::new(
            Self::content_for(request),
            ModelRef::new(Self::PROVIDER, "deterministic"),
        ))
    }

    fn name(&self) -> &str {
        Self::PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use specrun_audit::{MarkerMatcher, checks::string_leaves};

    #[tokio::test]
    async fn dry_run_content_validates_for_every_role() {
        for role in Role::ALL {
            let request = RoleRequest::new(RunId::generate(), role, "Build a task tracker");
            let output = DryRunExecutor.invoke(&request).await.unwrap();
            assert!(
                role.output().validate_content(&output.content).is_ok(),
                "{role}: {:?}",
                role.output().validate_content(&output.content)
            );
            assert!(MarkerMatcher::default().find(string_leaves(&output.content)).is_empty());
        }
    }

    #[test]
    fn dry_run_traces_upstream_ids() {
        let run = RunId::generate();
        let brief = Artifact::builder(ArtifactType::ProblemBrief, run.clone())
            .created_by("IntakeAnalyst", "IntakeAnalyst#0")
            .build(json!({"goals": [{"id": "OBJ-0001"}]}));
        let request = RoleRequest::new(run, Role::BusinessAnalyst, "x").with_inputs(vec![brief]);
        let content = DryRunExecutor::content_for(&request);
        assert_eq!(content["functional_requirements"][0]["traces"], json!(["OBJ-0001"]));
    }

    #[test]
    fn registry_prefers_role_specific_executor() {
        struct Named;
        #[async_trait]
        impl RoleExecutor for Named {
            async fn invoke(&self, _: &RoleRequest) -> Result<RoleOutput, ExecutorError> {
                Err(ExecutorError::Fatal("unused".into()))
            }
            fn name(&self) -> &str {
                "named"
            }
        }
        let registry = ExecutorRegistry::dry_run().with_role(Role::Architect, Arc::new(Named));
        assert_eq!(registry.resolve(Role::Architect).unwrap().name(), "named");
        assert_eq!(registry.resolve(Role::Planner).unwrap().name(), "dry-run");
        assert!(ExecutorRegistry::new().resolve(Role::Planner).is_none());
    }
}
