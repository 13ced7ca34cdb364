//! Pipeline configuration
//!
//! A static snapshot consumed once at run start. [`PipelineConfig::default`]
//! is a complete working pipeline; YAML files override any subset of it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use specrun_artifact::{ArtifactType, RunState};
use specrun_audit::{Rubric, Rule, SemanticGate, StateGates, SufficiencyPolicy};

use crate::error::ConfigError;
use crate::rate_limit::RetryPolicy;
use crate::role::Role;
use crate::synthesis::{InstancePattern, InstancePolicy};

/// What happens when the sufficiency gate fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnInsufficient {
    /// Stop the run and surface the blocking gaps
    #[default]
    Stop,
    /// Ask the Clarifier, fold its answers into the input and reassess
    ClarifyRetry,
}

/// Audit thresholds and switches
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    #[serde(flatten)]
    pub sufficiency: SufficiencyPolicy,
    pub on_insufficient: OnInsufficient,
    /// Enforce the traceability rule at Review
    pub require_full_traceability: bool,
    pub semantic_gates: IndexMap<RunState, Vec<SemanticGate>>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        let mut semantic_gates = IndexMap::new();
        semantic_gates.insert(
            RunState::Review,
            vec![SemanticGate {
                name: "review_quality".to_string(),
                rubric: Rubric::new("review_quality", "v1"),
                threshold: 0.7,
            }],
        );
        Self {
            sufficiency: SufficiencyPolicy::default(),
            on_insufficient: OnInsufficient::Stop,
            require_full_traceability: true,
            semantic_gates,
        }
    }
}

/// Per-role override of declared inputs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<ArtifactType>>,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    /// Recorded with every decision event
    pub policy_version: String,
    pub runs_directory: PathBuf,
    /// Roles per state, executed in listed order
    pub states: IndexMap<RunState, Vec<Role>>,
    pub roles: IndexMap<Role, RoleOverride>,
    pub instance_policies: IndexMap<Role, InstancePolicy>,
    pub audit: AuditConfig,
    pub retry: RetryPolicy,
    /// Revisions a state may attempt before the run stops
    pub max_state_retries: u32,
    pub run_timeout_ms: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let mut states = IndexMap::new();
        states.insert(RunState::Intake, vec![Role::IntakeAnalyst]);
        states.insert(RunState::Clarify, vec![Role::Clarifier]);
        states.insert(RunState::Requirements, vec![Role::BusinessAnalyst, Role::NfrAnalyst]);
        states.insert(
            RunState::Architecture,
            vec![Role::Architect, Role::C4Modeler, Role::TechAdvisor],
        );
        states.insert(RunState::ImplementableSpec, vec![Role::SpecWriter]);
        states.insert(
            RunState::ImplementationDesign,
            vec![Role::Designer, Role::Planner, Role::TestPlanner],
        );
        states.insert(RunState::Review, vec![Role::Reviewer]);
        Self {
            name: "default".to_string(),
            policy_version: "v1".to_string(),
            runs_directory: PathBuf::from("runs"),
            states,
            roles: IndexMap::new(),
            instance_policies: IndexMap::new(),
            audit: AuditConfig::default(),
            retry: RetryPolicy::default(),
            max_state_retries: 2,
            run_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate YAML
    ///
    /// # Errors
    /// [`ConfigError::Parse`] or [`ConfigError::Invalid`]
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file
    ///
    /// # Errors
    /// [`ConfigError::Io`] if unreadable, otherwise as [`Self::from_yaml_str`]
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    #[inline]
    #[must_use]
    pub fn with_runs_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runs_directory = dir.into();
        self
    }

    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_max_state_retries(mut self, retries: u32) -> Self {
        self.max_state_retries = retries;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    #[must_use]
    pub fn with_sufficiency(mut self, sufficiency: SufficiencyPolicy) -> Self {
        self.audit.sufficiency = sufficiency;
        self
    }

    #[must_use]
    pub fn with_on_insufficient(mut self, on_insufficient: OnInsufficient) -> Self {
        self.audit.on_insufficient = on_insufficient;
        self
    }

    #[must_use]
    pub fn with_state_roles(mut self, state: RunState, roles: Vec<Role>) -> Self {
        self.states.insert(state, roles);
        self
    }

    #[must_use]
    pub fn with_instance_policy(mut self, role: Role, policy: InstancePolicy) -> Self {
        self.instance_policies.insert(role, policy);
        self
    }

    #[must_use]
    pub fn with_semantic_gate(mut self, state: RunState, gate: SemanticGate) -> Self {
        self.audit.semantic_gates.entry(state).or_default().push(gate);
        self
    }

    /// Roles configured for `state`, in execution order
    #[must_use]
    pub fn roles_for(&self, state: RunState) -> &[Role] {
        self.states.get(&state).map_or(&[], Vec::as_slice)
    }

    /// Declared inputs of `role`
    #[must_use]
    pub fn inputs_for(&self, role: Role) -> Vec<ArtifactType> {
        self.roles
            .get(&role)
            .and_then(|o| o.inputs.clone())
            .unwrap_or_else(|| role.default_inputs().to_vec())
    }

    #[must_use]
    pub fn instance_policy(&self, role: Role) -> InstancePolicy {
        self.instance_policies.get(&role).cloned().unwrap_or_default()
    }

    /// State whose roles (or orchestrator step) produce `artifact_type`
    #[must_use]
    pub fn state_producing(&self, artifact_type: ArtifactType) -> Option<RunState> {
        if artifact_type == ArtifactType::InfoSufficiencyAssessment {
            return Some(RunState::Clarify);
        }
        RunState::PIPELINE
            .into_iter()
            .find(|s| self.roles_for(*s).iter().any(|r| r.output() == artifact_type))
    }

    /// Every role in pipeline order
    pub fn all_roles(&self) -> impl Iterator<Item = (RunState, Role)> + '_ {
        RunState::PIPELINE
            .into_iter()
            .flat_map(move |s| self.roles_for(s).iter().map(move |r| (s, *r)))
    }

    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_ms.map(Duration::from_millis)
    }

    /// Gates evaluated before leaving `state`
    #[must_use]
    pub fn gates_for(&self, state: RunState) -> StateGates {
        let mut gates = StateGates::structural();
        if state >= RunState::Architecture {
            gates = gates.with_rule(Rule::Consistency);
        }
        if state == RunState::Review && self.audit.require_full_traceability {
            gates = gates.with_rule(Rule::Traceability);
        }
        for gate in self.audit.semantic_gates.get(&state).into_iter().flatten() {
            gates = gates.with_semantic(gate.clone());
        }
        gates
    }

    /// Reject configurations the orchestrator cannot run
    ///
    /// # Errors
    /// [`ConfigError::Invalid`] naming the offending key
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_timeout_ms == Some(0) {
            return Err(ConfigError::invalid("run_timeout_ms", "must be positive"));
        }
        if self.states.values().all(Vec::is_empty) {
            return Err(ConfigError::invalid("states", "no roles configured"));
        }
        for state in self.states.keys() {
            if state.is_terminal() {
                return Err(ConfigError::invalid(
                    format!("states.{state}"),
                    "terminal states cannot run roles",
                ));
            }
        }

        let mut produced: Vec<ArtifactType> = Vec::new();
        for (state, role) in self.all_roles() {
            if state >= RunState::Clarify && !produced.contains(&ArtifactType::InfoSufficiencyAssessment) {
                produced.push(ArtifactType::InfoSufficiencyAssessment);
            }
            for input in self.inputs_for(role) {
                if !produced.contains(&input) {
                    return Err(ConfigError::invalid(
                        format!("roles.{role}.inputs"),
                        format!("{input} is not produced before {role} runs in {state}"),
                    ));
                }
            }
            if produced.contains(&role.output()) {
                return Err(ConfigError::invalid(
                    format!("states.{state}"),
                    format!("{} is produced by more than one role", role.output()),
                ));
            }
            produced.push(role.output());
        }

        self.audit
            .sufficiency
            .validate()
            .map_err(|e| ConfigError::invalid("audit", e.to_string()))?;
        for (state, gates) in &self.audit.semantic_gates {
            for gate in gates {
                if !(0.0..=1.0).contains(&gate.threshold) {
                    return Err(ConfigError::invalid(
                        format!("audit.semantic_gates.{state}.{}", gate.name),
                        format!("threshold {} outside [0, 1]", gate.threshold),
                    ));
                }
            }
        }

        for (role, policy) in &self.instance_policies {
            let zero = match policy.pattern {
                InstancePattern::Single => false,
                InstancePattern::Alternatives { count } | InstancePattern::Debate { count } => count == 0,
                InstancePattern::GenerateAndCritique { critics } => critics == 0,
            };
            if zero {
                return Err(ConfigError::invalid(
                    format!("instance_policies.{role}"),
                    "instance count must be at least 1",
                ));
            }
            if !(0.0..=1.0).contains(&policy.min_ambiguity) {
                return Err(ConfigError::invalid(
                    format!("instance_policies.{role}.min_ambiguity"),
                    "must be within [0, 1]",
                ));
            }
        }

        if self.retry.exponential_base < 1.0 {
            return Err(ConfigError::invalid("retry.exponential_base", "must be at least 1.0"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::invalid("retry.jitter", "must be within [0, 1]"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.roles_for(RunState::Architecture).len(), 3);
        assert_eq!(config.state_producing(ArtifactType::WorkBreakdown), Some(RunState::ImplementationDesign));
        assert_eq!(config.state_producing(ArtifactType::ThreatModel), None);
    }

    #[test]
    fn timeout_keeps_sub_second_precision() {
        let config = PipelineConfig::default().with_timeout(Duration::from_millis(900));
        assert_eq!(config.run_timeout(), Some(Duration::from_millis(900)));
        config.validate().unwrap();

        let zero = PipelineConfig::default().with_timeout(Duration::ZERO);
        assert!(matches!(zero.validate(), Err(ConfigError::Invalid { key, .. }) if key == "run_timeout_ms"));
    }

    #[test]
    fn yaml_overrides_subset() {
        let config = PipelineConfig::from_yaml_str(
            r"
name: lean
max_state_retries: 1
audit:
  min_confidence_to_proceed: 0.8
  on_insufficient: clarify_retry
retry:
  max_retries: 2
  initial_delay_ms: 10
instance_policies:
  Architect:
    pattern: alternatives
    count: 2
    min_ambiguity: 0.3
",
        )
        .unwrap();
        assert_eq!(config.name, "lean");
        assert_eq!(config.audit.sufficiency.min_confidence_to_proceed, 0.8);
        assert_eq!(config.audit.on_insufficient, OnInsufficient::ClarifyRetry);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(10));
        assert_eq!(config.retry.exponential_base, 2.0);
        assert_eq!(
            config.instance_policy(Role::Architect).select(0.5),
            InstancePattern::Alternatives { count: 2 }
        );
        assert_eq!(config.roles_for(RunState::Review), &[Role::Reviewer]);
    }

    #[test]
    fn input_produced_later_is_rejected() {
        let err = PipelineConfig::default()
            .with_state_roles(RunState::Requirements, vec![Role::Designer])
            .validate()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "roles.Designer.inputs"), "{err}");
    }

    #[test]
    fn duplicate_producer_is_rejected() {
        let err = PipelineConfig::default()
            .with_state_roles(RunState::Review, vec![Role::Reviewer, Role::Planner])
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("more than one role"));
    }

    #[test]
    fn terminal_state_key_is_rejected() {
        let err = PipelineConfig::from_yaml_str("states:\n  Final: [Reviewer]\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "states.Final"));
    }

    #[test]
    fn review_gates_include_traceability_and_semantic() {
        let gates = PipelineConfig::default().gates_for(RunState::Review);
        assert!(gates.deterministic.contains(&Rule::Traceability));
        assert!(gates.deterministic.contains(&Rule::Consistency));
        assert_eq!(gates.semantic.len(), 1);
        let early = PipelineConfig::default().gates_for(RunState::Intake);
        assert_eq!(early, StateGates::structural());
    }

    #[test]
    fn unknown_role_fails_to_parse() {
        assert!(matches!(
            PipelineConfig::from_yaml_str("states:\n  Intake: [Wizard]\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
