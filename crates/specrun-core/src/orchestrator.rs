//! Gated run orchestrator
//!
//! Drives one run through the pipeline. Each working state executes its
//! roles, audits their canonical outputs and then advances, revises in place
//! or stops. Every step is persisted before the next begins, so an
//! interrupted run resumes from its metadata without re-invoking roles whose
//! canonical artifacts already exist.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use specrun_artifact::store::AUDIT_RESULTS_FILE;
use specrun_artifact::types::InfoSufficiencyAssessmentContent;
use specrun_artifact::{
    Artifact, ArtifactStore, ArtifactType, Clarification, ContentHash, Disposition, LockMode,
    ManifestEntry, ModelRef, PipelineInput, QualityMetadata, RunHandle, RunId, RunMetadata,
    RunState, StoreError,
};
use specrun_audit::checks::string_leaves;
use specrun_audit::traceability::REPORT_FILE;
use specrun_audit::{
    AuditEngine, AuditResult, GateReport, StateGates, SufficiencyAssessment, TraceabilityMatrix,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::collaboration::{
    Actor, CollaborationLog, ContentRef, Decision, EventType, NewEvent, TranscriptStore,
};
use crate::config::{OnInsufficient, PipelineConfig};
use crate::error::{ExecutorError, LogError, OrchestratorError, RateLimitError};
use crate::executor::{ExecutorRegistry, InstanceMode, RoleExecutor, RoleOutput, RoleRequest};
use crate::rate_limit::invoke_with_retry;
use crate::role::Role;
use crate::state_machine::validate_transition;
use crate::synthesis::{merge_contents, rubric_scored, InstancePattern, InstancePolicy, Resolution};

/// One gate result as persisted in `audits/audit_results.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub state: RunState,
    /// `state_retries` at the time the gates ran
    pub attempt: u32,
    #[serde(flatten)]
    pub result: AuditResult,
}

/// Every gate result recorded for a run, oldest first
///
/// # Errors
/// Store read failures other than the report not existing yet
pub fn read_audit_records(store: &ArtifactStore, run_id: &RunId) -> Result<Vec<AuditRecord>, StoreError> {
    match store.read_report(run_id, AUDIT_RESULTS_FILE) {
        Ok(records) => Ok(records),
        Err(StoreError::NotFound(_)) => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

/// What the gates decided for the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Advance,
    /// Re-run the roles producing `types` within the same state
    Revise { types: Vec<ArtifactType>, reason: String },
    Stop { reason: String },
}

/// Decide the next step from a gate report
///
/// Failures on subject `run` implicate every subject. Soft failures are
/// revised while retries remain and tolerated afterwards; hard failures stop
/// the run once retries are spent.
#[must_use]
pub fn decide(report: &GateReport, subjects: &[Artifact], retries_used: u32, max_retries: u32) -> Verdict {
    if report.passed() {
        return Verdict::Advance;
    }
    let hard = report.hard_failures().next().is_some();
    let reason = report.failure_summary();

    let mut types = Vec::new();
    for subject in report.failing_subjects() {
        if subject == "run" {
            types.extend(subjects.iter().map(Artifact::artifact_type));
        } else if let Some(artifact) = subjects.iter().find(|a| a.artifact_id() == subject) {
            types.push(artifact.artifact_type());
        }
    }
    types.sort();
    types.dedup();

    if retries_used < max_retries && !types.is_empty() {
        return Verdict::Revise { types, reason };
    }
    if hard {
        Verdict::Stop {
            reason: format!("gates failed after {retries_used} revision(s): {reason}"),
        }
    } else {
        Verdict::Advance
    }
}

/// How a run ended (or paused)
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub final_state: RunState,
    pub stop_reason: Option<String>,
    pub artifacts: Vec<ManifestEntry>,
    /// Wall time of this invocation only
    pub elapsed: Duration,
}

impl RunOutcome {
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.final_state == RunState::Final
    }

    /// Process exit code: 0 for `Final`, 2 for a stopped run
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            2
        }
    }
}

/// Runs pipelines against one artifact store
#[derive(Debug, Clone)]
pub struct Orchestrator {
    pub(crate) config: Arc<PipelineConfig>,
    pub(crate) store: ArtifactStore,
    pub(crate) executors: ExecutorRegistry,
    pub(crate) audit: AuditEngine,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Orchestrator over `config.runs_directory`
    #[must_use]
    pub fn new(config: PipelineConfig, executors: ExecutorRegistry) -> Self {
        let store = ArtifactStore::new(config.runs_directory.clone());
        Self {
            config: Arc::new(config),
            store,
            executors,
            audit: AuditEngine::default(),
            cancel: CancellationToken::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_store(mut self, store: ArtifactStore) -> Self {
        self.store = store;
        self
    }

    #[inline]
    #[must_use]
    pub fn with_audit(mut self, audit: AuditEngine) -> Self {
        self.audit = audit;
        self
    }

    /// Cancelling `token` stops any run this orchestrator is driving
    #[inline]
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Gate results recorded so far for `run_id`
    ///
    /// # Errors
    /// Store read failures
    pub fn audit_records(&self, run_id: &RunId) -> Result<Vec<AuditRecord>, StoreError> {
        read_audit_records(&self.store, run_id)
    }

    /// The configuration must be valid and every configured role must
    /// resolve to an executor
    pub(crate) fn check_executors(&self) -> Result<(), OrchestratorError> {
        self.config.validate()?;
        for (_, role) in self.config.all_roles() {
            if self.executors.resolve(role).is_none() {
                return Err(OrchestratorError::NoExecutor(role));
            }
        }
        if self.config.audit.on_insufficient == OnInsufficient::ClarifyRetry
            && self.executors.resolve(Role::Clarifier).is_none()
        {
            return Err(OrchestratorError::NoExecutor(Role::Clarifier));
        }
        Ok(())
    }

    /// Start a new run and drive it until it finishes or stops
    ///
    /// # Errors
    /// Missing executors, store or log failures. Gate failures are not
    /// errors: they end the run in `Stopped`.
    pub async fn start(&self, input: PipelineInput) -> Result<RunOutcome, OrchestratorError> {
        self.check_executors()?;
        let metadata = RunMetadata::new(RunId::generate(), &self.config.name, &self.config.policy_version)
            .with_input(input);
        let handle = self.store.initialize_run(metadata)?;
        let log = CollaborationLog::open(&handle)?;
        info!(run_id = %handle.run_id(), pipeline = %self.config.name, "run started");
        log.append(
            &handle,
            NewEvent::decision(
                Decision::new("run_started", RunState::Intake, &self.config.policy_version)
                    .with_detail(json!({ "pipeline": self.config.name })),
                "run started",
            ),
        )?;
        self.drive(&handle, &log).await
    }

    /// Continue an interrupted run from its persisted state
    ///
    /// # Errors
    /// [`OrchestratorError::RunFinished`] for terminal runs,
    /// [`StoreError::RunLocked`] while another process holds the run
    pub async fn resume(&self, run_id: &RunId, mode: LockMode) -> Result<RunOutcome, OrchestratorError> {
        let metadata = self.store.read_metadata(run_id)?;
        if metadata.is_terminal() {
            return Err(OrchestratorError::RunFinished {
                run_id: run_id.clone(),
                state: metadata.state,
            });
        }
        self.check_executors()?;
        let handle = self.store.open_run(run_id, mode)?;
        let log = CollaborationLog::open(&handle)?;
        let state = handle.metadata().state;
        info!(run_id = %run_id, state = %state, "run resumed");
        log.append(
            &handle,
            NewEvent::decision(
                Decision::new("run_resumed", state, &self.config.policy_version),
                format!("resumed in {state}"),
            ),
        )?;
        self.drive(&handle, &log).await
    }

    pub(crate) async fn drive(
        &self,
        handle: &RunHandle,
        log: &CollaborationLog,
    ) -> Result<RunOutcome, OrchestratorError> {
        let driver = Driver {
            orch: self,
            handle,
            log,
            cancel: self.cancel.child_token(),
            started: Instant::now(),
            prior_secs: handle.metadata().total_execution_time_secs,
            contained: Mutex::new(Vec::new()),
        };

        let interrupted = tokio::select! {
            result = driver.run() => {
                result?;
                None
            }
            () = self.cancel.cancelled() => Some("cancelled"),
            () = deadline(self.config.run_timeout()) => Some("timeout"),
        };
        if let Some(reason) = interrupted {
            driver.cancel.cancel();
            warn!(run_id = %handle.run_id(), reason, "run interrupted");
            driver.stop(reason.to_string())?;
        }

        let metadata = handle.metadata();
        Ok(RunOutcome {
            run_id: metadata.run_id,
            final_state: metadata.state,
            stop_reason: metadata.stop_reason,
            artifacts: metadata.artifacts_manifest,
            elapsed: driver.started.elapsed(),
        })
    }
}

/// Manifest path of the canonical `artifact_type` just written with `hash`
fn written_ref(metadata: &RunMetadata, artifact_type: ArtifactType, hash: ContentHash) -> Option<String> {
    metadata
        .latest_canonical(artifact_type)
        .filter(|entry| entry.content_hash == hash)
        .map(|entry| entry.file_ref.clone())
}

async fn deadline(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

enum Flow {
    Continue,
    Repeat,
    Done,
}

struct Candidate {
    index: usize,
    instance_id: String,
    output: RoleOutput,
}

/// Per-invocation state of one driven run
struct Driver<'a> {
    orch: &'a Orchestrator,
    handle: &'a RunHandle,
    log: &'a CollaborationLog,
    cancel: CancellationToken,
    started: Instant,
    prior_secs: f64,
    /// Instance failures absorbed while other instances survived
    contained: Mutex<Vec<(String, String)>>,
}

impl Driver<'_> {
    fn config(&self) -> &PipelineConfig {
        &self.orch.config
    }

    fn store(&self) -> &ArtifactStore {
        &self.orch.store
    }

    fn run_id(&self) -> &RunId {
        self.handle.run_id()
    }

    fn policy_version(&self) -> &str {
        &self.config().policy_version
    }

    fn total_secs(&self) -> f64 {
        self.prior_secs + self.started.elapsed().as_secs_f64()
    }

    fn inconsistent(&self, reason: impl Into<String>) -> OrchestratorError {
        OrchestratorError::Inconsistent {
            run_id: self.run_id().clone(),
            reason: reason.into(),
        }
    }

    async fn run(&self) -> Result<(), OrchestratorError> {
        loop {
            let state = self.handle.metadata().state;
            if state.is_terminal() {
                return Ok(());
            }
            self.step(state).await?;
        }
    }

    async fn step(&self, state: RunState) -> Result<(), OrchestratorError> {
        debug!(run_id = %self.run_id(), state = %state, "entering state");
        if state == RunState::Clarify {
            match self.clarify().await? {
                Flow::Continue => {}
                Flow::Repeat | Flow::Done => return Ok(()),
            }
        }

        for &role in self.config().roles_for(state) {
            let metadata = self.handle.metadata();
            let output = role.output();
            if metadata.latest_canonical(output).is_some() && !metadata.pending_revision.contains(&output) {
                debug!(role = %role, artifact_type = %output, "canonical artifact present, skipping");
                continue;
            }
            if let Err(failure) = self.run_role(state, role).await? {
                return self.role_failed(state, role, &failure);
            }
        }

        self.evaluate(state).await
    }

    fn role_failed(&self, state: RunState, role: Role, failure: &RateLimitError) -> Result<(), OrchestratorError> {
        let retries = self.handle.metadata().state_retries;
        let reason = format!("{role} failed: {failure}");
        if !failure.is_recoverable() || retries >= self.config().max_state_retries {
            return self.stop_with(state, reason, None);
        }
        warn!(run_id = %self.run_id(), state = %state, role = %role, error = %failure, "role failed, retrying state");
        self.record_decision(
            Decision::new("revise", state, self.policy_version())
                .with_detail(json!({ "role": role, "reason": reason })),
            format!("retrying {state} after {role} failure"),
        )?;
        self.store().update_metadata(self.handle, |m| m.state_retries += 1)?;
        Ok(())
    }

    /// Execute one role; the inner error is a contained role failure
    async fn run_role(&self, state: RunState, role: Role) -> Result<Result<(), RateLimitError>, OrchestratorError> {
        let executor = self
            .orch
            .executors
            .resolve(role)
            .ok_or(OrchestratorError::NoExecutor(role))?;
        let metadata = self.handle.metadata();
        let output_type = role.output();

        let inputs = self.load_inputs(&metadata, &self.config().inputs_for(role))?;
        let previous = metadata
            .latest_canonical(output_type)
            .map(|entry| self.store().read_artifact_by_ref(self.run_id(), entry))
            .transpose()?;
        let feedback = match &previous {
            Some(prev) => self.feedback_for(state, &metadata, prev.artifact_id())?,
            None => Vec::new(),
        };
        let assessment = self.latest_assessment(&metadata)?;
        let ambiguity = assessment
            .as_ref()
            .and_then(|a| a.confidence_score)
            .map_or(0.0, |confidence| 1.0 - confidence);

        let mut request = RoleRequest::new(self.run_id().clone(), role, self.effective_input(&metadata)?)
            .with_inputs(inputs);
        request.previous = previous;
        request.feedback = feedback;
        request.amendment = metadata.amendment.clone();
        if role == Role::Clarifier {
            request.blocking_gaps = assessment.map(|a| a.blocking_gaps).unwrap_or_default();
        }

        let policy = self.config().instance_policy(role);
        let pattern = policy.select(ambiguity);
        self.record_decision(
            Decision::new("instances_selected", state, self.policy_version())
                .with_detail(json!({ "role": role, "pattern": pattern, "ambiguity": ambiguity })),
            format!("{role}: {} instance(s)", pattern.candidate_count()),
        )?;
        debug!(role = %role, ?pattern, ambiguity, "invoking role");

        let generated = self.generate(executor.as_ref(), &request, pattern).await;
        self.log_contained_failures(role)?;
        let mut candidates = match generated {
            Ok(candidates) => candidates,
            Err(failure) => return Ok(Err(failure)),
        };

        let draft = ArtifactDraft {
            request: &request,
            revision: request.previous.as_ref().map_or(1, |p| p.revision() + 1),
            artifact_id: request
                .previous
                .as_ref()
                .map_or_else(|| output_type.as_str().to_string(), |p| p.artifact_id().to_string()),
            base_run: metadata.base_run_id.clone(),
        };
        let canonical = if candidates.len() == 1 {
            let only = candidates.remove(0);
            draft.build(&only.instance_id, &only.output, Disposition::Canonical, draft.artifact_id.clone())
        } else {
            self.synthesize(state, &draft, &policy, &candidates).await?
        };

        self.persist(&canonical, Actor::Role(role))?;
        info!(
            run_id = %self.run_id(),
            state = %state,
            role = %role,
            revision = canonical.revision(),
            "artifact produced"
        );
        Ok(Ok(()))
    }

    /// Write a canonical artifact and log its production
    fn persist(&self, artifact: &Artifact, actor: Actor) -> Result<(), OrchestratorError> {
        let artifact_type = artifact.artifact_type();
        let hash = self.store().write_artifact(self.handle, artifact)?;
        let metadata = self
            .store()
            .update_metadata(self.handle, |m| m.pending_revision.retain(|t| *t != artifact_type))?;
        let file_ref = written_ref(&metadata, artifact_type, hash)
            .ok_or_else(|| self.inconsistent(format!("{artifact_type} missing from manifest after write")))?;
        let event_type = if artifact.revision() > 1 {
            EventType::ArtifactRevised
        } else {
            EventType::ArtifactProduced
        };
        self.log.append(
            self.handle,
            NewEvent::new(actor, event_type, format!("{artifact_type} revision {}", artifact.revision()))
                .with_references(vec![artifact.artifact_id().to_string()])
                .with_content_ref(ContentRef {
                    path: file_ref,
                    content_hash: hash,
                }),
        )?;
        Ok(())
    }

    async fn generate(
        &self,
        executor: &dyn RoleExecutor,
        base: &RoleRequest,
        pattern: InstancePattern,
    ) -> Result<Vec<Candidate>, RateLimitError> {
        match pattern {
            InstancePattern::Single => {
                let output = self.invoke(executor, base).await?;
                Ok(vec![Candidate {
                    index: base.instance_index,
                    instance_id: base.instance_id.clone(),
                    output,
                }])
            }
            InstancePattern::Alternatives { count } => {
                let requests: Vec<_> = (0..count.max(1))
                    .map(|i| base.clone().with_instance(i, InstanceMode::Generate))
                    .collect();
                self.invoke_all(executor, &requests).await
            }
            InstancePattern::GenerateAndCritique { critics } => {
                let draft = self.invoke(executor, base).await?;
                let requests: Vec<_> = (1..=critics.max(1))
                    .map(|i| {
                        base.clone().with_instance(
                            i,
                            InstanceMode::Critique {
                                draft: draft.content.clone(),
                            },
                        )
                    })
                    .collect();
                let mut candidates = vec![Candidate {
                    index: base.instance_index,
                    instance_id: base.instance_id.clone(),
                    output: draft,
                }];
                match self.invoke_all(executor, &requests).await {
                    Ok(critiques) => candidates.extend(critiques),
                    Err(e) => warn!(role = %base.role, error = %e, "every critic failed, keeping the draft"),
                }
                Ok(candidates)
            }
            InstancePattern::Debate { count } => {
                let openers: Vec<_> = (0..count.max(1))
                    .map(|i| base.clone().with_instance(i, InstanceMode::Generate))
                    .collect();
                let opening = self.invoke_all(executor, &openers).await?;
                if opening.len() < 2 {
                    return Ok(opening);
                }
                let rebuttals: Vec<_> = opening
                    .iter()
                    .map(|candidate| {
                        let peers = opening
                            .iter()
                            .filter(|peer| peer.index != candidate.index)
                            .map(|peer| peer.output.content.clone())
                            .collect();
                        base.clone().with_instance(candidate.index, InstanceMode::Rebut { peers })
                    })
                    .collect();
                match self.invoke_all(executor, &rebuttals).await {
                    Ok(closing) => Ok(closing),
                    Err(e) => {
                        warn!(role = %base.role, error = %e, "every rebuttal failed, keeping opening round");
                        Ok(opening)
                    }
                }
            }
        }
    }

    /// Run instances concurrently, keeping survivors
    async fn invoke_all(
        &self,
        executor: &dyn RoleExecutor,
        requests: &[RoleRequest],
    ) -> Result<Vec<Candidate>, RateLimitError> {
        let results = join_all(requests.iter().map(|r| self.invoke(executor, r))).await;
        let mut survivors = Vec::with_capacity(requests.len());
        let mut last_error = None;
        for (request, result) in requests.iter().zip(results) {
            match result {
                Ok(output) => survivors.push(Candidate {
                    index: request.instance_index,
                    instance_id: request.instance_id.clone(),
                    output,
                }),
                Err(e) => {
                    warn!(instance = %request.instance_id, error = %e, "instance failed");
                    self.contained.lock().push((request.instance_id.clone(), e.to_string()));
                    last_error = Some(e);
                }
            }
        }
        match (survivors.is_empty(), last_error) {
            (true, Some(e)) => Err(e),
            _ => Ok(survivors),
        }
    }

    async fn invoke(&self, executor: &dyn RoleExecutor, request: &RoleRequest) -> Result<RoleOutput, RateLimitError> {
        let output = invoke_with_retry(executor, request, &self.config().retry, &self.cancel).await?;
        request
            .role
            .output()
            .validate_content(&output.content)
            .map_err(|problems| {
                RateLimitError::Fatal(ExecutorError::InvalidOutput {
                    role: request.role,
                    problems,
                })
            })?;
        Ok(output)
    }

    fn log_contained_failures(&self, role: Role) -> Result<(), OrchestratorError> {
        let failures = std::mem::take(&mut *self.contained.lock());
        for (instance_id, reason) in failures {
            self.log.append(
                self.handle,
                NewEvent::new(
                    Actor::Role(role),
                    EventType::OrchestratorDecisionMade,
                    format!("{instance_id} failed: {reason}"),
                )
                .with_references(vec![instance_id]),
            )?;
        }
        Ok(())
    }

    /// Persist alternatives and resolve them into one canonical artifact
    async fn synthesize(
        &self,
        state: RunState,
        draft: &ArtifactDraft<'_>,
        policy: &InstancePolicy,
        candidates: &[Candidate],
    ) -> Result<Artifact, OrchestratorError> {
        let output_type = draft.request.role.output();
        let alternatives: Vec<Artifact> = candidates
            .iter()
            .map(|c| {
                draft.build(
                    &c.instance_id,
                    &c.output,
                    Disposition::Alternative,
                    format!("{output_type}~{}", c.instance_id),
                )
            })
            .collect();
        for alternative in &alternatives {
            self.store().write_artifact(self.handle, alternative)?;
        }
        let references: Vec<String> = alternatives.iter().map(|a| a.artifact_id().to_string()).collect();

        let (canonical, detail, rubric_version) = match policy.resolution {
            Resolution::RubricScored => {
                let evaluator = self.orch.audit.evaluator();
                let (best, scores) = rubric_scored(evaluator.as_ref(), &policy.rubric, &alternatives).await;
                let winner = &candidates[best];
                let canonical = draft.build(
                    &winner.instance_id,
                    &winner.output,
                    Disposition::Canonical,
                    draft.artifact_id.clone(),
                );
                let detail = json!({
                    "resolution": "rubric_scored",
                    "selected": references[best],
                    "scores": scores,
                });
                (canonical, detail, Some(policy.rubric.version.clone()))
            }
            Resolution::Merge => {
                let contents: Vec<Value> = candidates.iter().map(|c| c.output.content.clone()).collect();
                let merged = merge_contents(&contents);
                if let Err(problems) = output_type.validate_content(&merged) {
                    warn!(artifact_type = %output_type, ?problems, "merged content invalid, using first candidate");
                    let first = &candidates[0];
                    let canonical = draft.build(
                        &first.instance_id,
                        &first.output,
                        Disposition::Canonical,
                        draft.artifact_id.clone(),
                    );
                    (canonical, json!({ "resolution": "merge_fallback", "problems": problems }), None)
                } else {
                    let merged_output = RoleOutput::new(merged, ModelRef::orchestrator())
                        .with_quality(QualityMetadata::default());
                    let mut canonical = draft.build(
                        "orchestrator",
                        &merged_output,
                        Disposition::Canonical,
                        draft.artifact_id.clone(),
                    );
                    canonical.provenance.created_by_role = "orchestrator".to_string();
                    (canonical, json!({ "resolution": "merge" }), None)
                }
            }
        };

        self.log.append(
            self.handle,
            NewEvent::decision(
                Decision::new("synthesized", state, self.policy_version())
                    .with_rubric(rubric_version)
                    .with_detail(detail),
                format!("{} candidates resolved into {output_type}", alternatives.len()),
            )
            .with_references(references),
        )?;
        Ok(canonical)
    }

    async fn evaluate(&self, state: RunState) -> Result<(), OrchestratorError> {
        let metadata = self.handle.metadata();
        let run_artifacts = self.store().canonical_artifacts(self.run_id())?;
        let types: Vec<ArtifactType> = self.config().roles_for(state).iter().map(|r| r.output()).collect();
        let subjects: Vec<Artifact> = run_artifacts
            .iter()
            .filter(|a| types.contains(&a.artifact_type()))
            .cloned()
            .collect();

        let gates = self.config().gates_for(state);
        let report = self.orch.audit.evaluate_state(state, &gates, &subjects, &run_artifacts).await;
        self.record_results(state, metadata.state_retries, &report.results)?;
        self.log_gates(&report)?;

        let rubric = rubric_versions(&gates);
        match decide(&report, &subjects, metadata.state_retries, self.config().max_state_retries) {
            Verdict::Advance => self.advance(state, rubric, &report),
            Verdict::Revise { types, reason } => self.revise(state, types, reason, rubric),
            Verdict::Stop { reason } => self.stop_with(state, reason, rubric),
        }
    }

    fn log_gates(&self, report: &GateReport) -> Result<(), OrchestratorError> {
        let mut by_gate: BTreeMap<&str, Vec<&AuditResult>> = BTreeMap::new();
        for result in &report.results {
            by_gate.entry(result.gate_name.as_str()).or_default().push(result);
        }
        for (gate, results) in by_gate {
            let failed: Vec<String> = results.iter().filter(|r| !r.passed).map(|r| r.describe()).collect();
            let (event_type, summary) = if failed.is_empty() {
                (EventType::AuditGatePassed, format!("{gate} passed"))
            } else {
                (EventType::AuditGateFailed, failed.join("; "))
            };
            let references: BTreeSet<String> = results.iter().map(|r| r.subject.clone()).collect();
            self.log.append(
                self.handle,
                NewEvent::new(Actor::Orchestrator, event_type, summary)
                    .with_references(references.into_iter().collect()),
            )?;
        }
        Ok(())
    }

    fn advance(&self, state: RunState, rubric: Option<String>, report: &GateReport) -> Result<(), OrchestratorError> {
        let next = state
            .next()
            .ok_or_else(|| self.inconsistent(format!("{state} has no successor")))?;
        validate_transition(state, next)?;
        if next == RunState::Final {
            return self.finalize(state, rubric);
        }
        self.record_decision(
            Decision::new("advance", state, self.policy_version())
                .with_rubric(rubric)
                .with_detail(json!({ "next": next, "soft_failures": report.soft_failures().count() })),
            format!("{state} -> {next}"),
        )?;
        self.store().update_metadata(self.handle, |m| {
            m.state = next;
            m.state_retries = 0;
            m.pending_revision.clear();
        })?;
        info!(run_id = %self.run_id(), from = %state, to = %next, "state advanced");
        Ok(())
    }

    fn revise(
        &self,
        state: RunState,
        types: Vec<ArtifactType>,
        reason: String,
        rubric: Option<String>,
    ) -> Result<(), OrchestratorError> {
        validate_transition(state, state)?;
        warn!(run_id = %self.run_id(), state = %state, reason = %reason, "revising state");
        self.record_decision(
            Decision::new("revise", state, self.policy_version())
                .with_rubric(rubric)
                .with_detail(json!({ "types": types, "reason": reason })),
            format!("revising {state}"),
        )?;
        self.store().update_metadata(self.handle, move |m| {
            m.state_retries += 1;
            m.pending_revision = types;
        })?;
        Ok(())
    }

    fn finalize(&self, state: RunState, rubric: Option<String>) -> Result<(), OrchestratorError> {
        let artifacts = self.store().canonical_artifacts(self.run_id())?;
        let matrix = TraceabilityMatrix::build(&artifacts);
        self.store().write_report(self.handle, REPORT_FILE, &matrix.to_content())?;
        self.record_decision(
            Decision::new("finalize", state, self.policy_version())
                .with_rubric(rubric)
                .with_detail(json!({
                    "artifacts": artifacts.len(),
                    "traceability_gaps": matrix.gaps().len(),
                })),
            "run finalized",
        )?;
        let total = self.total_secs();
        self.store().update_metadata(self.handle, |m| {
            m.state = RunState::Final;
            m.execution_successful = Some(true);
            m.stop_reason = None;
            m.state_retries = 0;
            m.pending_revision.clear();
            m.total_execution_time_secs = total;
        })?;
        info!(run_id = %self.run_id(), artifacts = artifacts.len(), elapsed_secs = total, "run finalized");
        Ok(())
    }

    fn stop(&self, reason: String) -> Result<(), OrchestratorError> {
        let state = self.handle.metadata().state;
        self.stop_with(state, reason, None)
    }

    fn stop_with(&self, state: RunState, reason: String, rubric: Option<String>) -> Result<(), OrchestratorError> {
        if self.handle.metadata().is_terminal() {
            return Ok(());
        }
        validate_transition(state, RunState::Stopped)?;
        self.record_decision(
            Decision::new("stop", state, self.policy_version())
                .with_rubric(rubric)
                .with_detail(json!({ "reason": reason })),
            format!("stopped in {state}"),
        )?;
        let total = self.total_secs();
        error!(run_id = %self.run_id(), state = %state, reason = %reason, "run stopped");
        self.store().update_metadata(self.handle, move |m| {
            m.state = RunState::Stopped;
            m.execution_successful = Some(false);
            m.stop_reason = Some(reason);
            m.total_execution_time_secs = total;
        })?;
        Ok(())
    }

    fn record_decision(&self, decision: Decision, summary: impl Into<String>) -> Result<(), OrchestratorError> {
        self.log.append(self.handle, NewEvent::decision(decision, summary))?;
        Ok(())
    }

    fn record_results(&self, state: RunState, attempt: u32, results: &[AuditResult]) -> Result<(), OrchestratorError> {
        let mut records = read_audit_records(self.store(), self.run_id())?;
        records.extend(results.iter().cloned().map(|result| AuditRecord { state, attempt, result }));
        self.store().write_audit_results(self.handle, &records)?;
        Ok(())
    }

    /// Failed results from the previous attempt that concern `artifact_id`
    fn feedback_for(&self, state: RunState, metadata: &RunMetadata, artifact_id: &str) -> Result<Vec<String>, OrchestratorError> {
        let Some(attempt) = metadata.state_retries.checked_sub(1) else {
            return Ok(Vec::new());
        };
        Ok(read_audit_records(self.store(), self.run_id())?
            .into_iter()
            .filter(|r| r.state == state && r.attempt == attempt && !r.result.passed)
            .filter(|r| r.result.subject == artifact_id || r.result.subject == "run")
            .map(|r| r.result.describe())
            .collect())
    }

    fn load_inputs(&self, metadata: &RunMetadata, types: &[ArtifactType]) -> Result<Vec<Artifact>, OrchestratorError> {
        types
            .iter()
            .filter_map(|t| metadata.latest_canonical(*t))
            .map(|entry| Ok(self.store().read_artifact_by_ref(self.run_id(), entry)?))
            .collect()
    }

    fn latest_assessment(&self, metadata: &RunMetadata) -> Result<Option<InfoSufficiencyAssessmentContent>, OrchestratorError> {
        let Some(entry) = metadata.latest_canonical(ArtifactType::InfoSufficiencyAssessment) else {
            return Ok(None);
        };
        let artifact = self.store().read_artifact_by_ref(self.run_id(), entry)?;
        artifact
            .typed_content()
            .map(Some)
            .map_err(|e| self.inconsistent(format!("unreadable sufficiency assessment: {e}")))
    }

    /// Pipeline input plus clarification answers and amended items
    fn effective_input(&self, metadata: &RunMetadata) -> Result<String, OrchestratorError> {
        let input = metadata
            .pipeline_input
            .as_ref()
            .ok_or_else(|| self.inconsistent("no pipeline input recorded"))?;
        let mut text = input.content.clone();
        for clarification in &metadata.clarifications {
            let path = self.handle.dir().join(&clarification.answer_ref);
            let answer = std::fs::read_to_string(&path).map_err(|e| LogError::io(&path, e))?;
            text.push_str("\n\n");
            text.push_str(answer.trim());
        }
        if let Some(amendment) = &metadata.amendment {
            for item in &amendment.amended_items {
                let value = match &item.value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                text.push('\n');
                text.push_str(&item.id);
                text.push_str(": ");
                text.push_str(&value);
            }
        }
        Ok(text)
    }

    async fn clarify(&self) -> Result<Flow, OrchestratorError> {
        let state = RunState::Clarify;
        let metadata = self.handle.metadata();
        let assessment = self.config().audit.sufficiency.assess(&self.effective_input(&metadata)?);
        self.write_assessment(&metadata, &assessment)?;

        let result = assessment.to_audit_result();
        self.record_results(state, metadata.state_retries, std::slice::from_ref(&result))?;
        let event_type = if assessment.passed() {
            EventType::AuditGatePassed
        } else {
            EventType::AuditGateFailed
        };
        self.log.append(
            self.handle,
            NewEvent::new(
                Actor::Orchestrator,
                event_type,
                format!(
                    "information sufficiency {:.2} (threshold {:.2})",
                    assessment.confidence_score, assessment.threshold
                ),
            )
            .with_references(vec![ArtifactType::InfoSufficiencyAssessment.as_str().to_string()]),
        )?;
        if assessment.passed() {
            return Ok(Flow::Continue);
        }

        let gaps: Vec<&str> = assessment.blocking_gaps.iter().map(|g| g.area.as_str()).collect();
        let reason = format!(
            "information sufficiency {:.2} below {:.2}; blocking gaps: {}",
            assessment.confidence_score,
            assessment.threshold,
            gaps.join(", ")
        );
        match self.config().audit.on_insufficient {
            OnInsufficient::Stop => {
                self.stop_with(state, reason, None)?;
                Ok(Flow::Done)
            }
            OnInsufficient::ClarifyRetry if metadata.state_retries >= self.config().max_state_retries => {
                self.stop_with(
                    state,
                    format!("{reason} after {} clarification round(s)", metadata.state_retries),
                    None,
                )?;
                Ok(Flow::Done)
            }
            OnInsufficient::ClarifyRetry => self.clarify_round(&metadata, &assessment).await,
        }
    }

    /// Write the assessment unless an identical one is already canonical
    fn write_assessment(&self, metadata: &RunMetadata, assessment: &SufficiencyAssessment) -> Result<(), OrchestratorError> {
        let artifact_type = ArtifactType::InfoSufficiencyAssessment;
        let content = serde_json::to_value(assessment.to_content())
            .map_err(|e| self.inconsistent(format!("cannot encode sufficiency assessment: {e}")))?;
        let previous = metadata.latest_canonical(artifact_type);
        if previous.is_some_and(|entry| entry.content_hash == ContentHash::of_json(&content)) {
            return Ok(());
        }
        let (artifact_id, revision) = previous.map_or_else(
            || (artifact_type.as_str().to_string(), 1),
            |entry| (entry.artifact_id.clone(), entry.revision + 1),
        );
        let artifact = Artifact::builder(artifact_type, self.run_id().clone())
            .artifact_id(artifact_id)
            .revision(revision)
            .base_run(metadata.base_run_id.clone())
            .build(content);
        self.persist(&artifact, Actor::Orchestrator)
    }

    async fn clarify_round(
        &self,
        metadata: &RunMetadata,
        assessment: &SufficiencyAssessment,
    ) -> Result<Flow, OrchestratorError> {
        let state = RunState::Clarify;
        let executor = self
            .orch
            .executors
            .resolve(Role::Clarifier)
            .ok_or(OrchestratorError::NoExecutor(Role::Clarifier))?;
        let round = metadata.clarifications.len() + 1;
        let nonce = Ulid::new();

        let questions: Vec<&str> = assessment
            .blocking_gaps
            .iter()
            .map(|g| g.suggested_question.as_str())
            .collect();
        let question_ref = TranscriptStore::write(
            self.handle,
            &format!("question-{round:02}-{nonce}.txt"),
            &questions.join("\n"),
        )?;
        self.log.append(
            self.handle,
            NewEvent::new(
                Actor::Orchestrator,
                EventType::StakeholderQuestionAsked,
                format!("clarification round {round}: {} question(s)", questions.len()),
            )
            .with_references(assessment.blocking_gaps.iter().map(|g| g.area.clone()).collect())
            .with_content_ref(question_ref.clone()),
        )?;

        let mut request = RoleRequest::new(self.run_id().clone(), Role::Clarifier, self.effective_input(metadata)?)
            .with_inputs(self.load_inputs(metadata, &self.config().inputs_for(Role::Clarifier))?);
        request.blocking_gaps = assessment.blocking_gaps.clone();
        request.amendment = metadata.amendment.clone();
        let output = match self.invoke(executor.as_ref(), &request).await {
            Ok(output) => output,
            Err(failure) => {
                self.stop_with(state, format!("{} failed: {failure}", Role::Clarifier), None)?;
                return Ok(Flow::Done);
            }
        };

        let answer_ref = TranscriptStore::write(
            self.handle,
            &format!("answer-{round:02}-{nonce}.txt"),
            &answer_text(&output.content),
        )?;
        self.log.append(
            self.handle,
            NewEvent::new(
                Actor::Role(Role::Clarifier),
                EventType::StakeholderAnswerReceived,
                format!("clarification round {round} answered"),
            )
            .with_content_ref(answer_ref.clone()),
        )?;
        let confidence_before = assessment.confidence_score;
        self.record_decision(
            Decision::new("clarify_retry", state, self.policy_version())
                .with_detail(json!({ "round": round, "confidence_before": confidence_before })),
            "reassessing with clarification answers",
        )?;
        self.store().update_metadata(self.handle, move |m| {
            m.clarifications.push(Clarification {
                question_ref: question_ref.path,
                answer_ref: answer_ref.path,
                confidence_before,
            });
            m.state_retries += 1;
        })?;
        info!(run_id = %self.run_id(), round, confidence_before, "clarification round recorded");
        Ok(Flow::Repeat)
    }
}

/// Shared envelope fields for everything one role invocation writes
struct ArtifactDraft<'r> {
    request: &'r RoleRequest,
    revision: u32,
    artifact_id: String,
    base_run: Option<RunId>,
}

impl ArtifactDraft<'_> {
    fn build(&self, instance_id: &str, output: &RoleOutput, disposition: Disposition, artifact_id: String) -> Artifact {
        let role = self.request.role;
        Artifact::builder(role.output(), self.request.run_id.clone())
            .artifact_id(artifact_id)
            .revision(self.revision)
            .base_run(self.base_run.clone())
            .created_by(role.as_str(), instance_id)
            .inputs(self.request.inputs.iter().map(Artifact::input_ref).collect())
            .model(output.model_ref.clone())
            .quality(output.quality.clone())
            .disposition(disposition)
            .build(output.content.clone())
    }
}

/// Clarifier output rendered as stakeholder answer text
fn answer_text(content: &Value) -> String {
    let statements: Vec<&str> = content
        .get("assumptions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|a| a.get("statement").and_then(Value::as_str))
        .collect();
    if statements.is_empty() {
        string_leaves(content).join("\n")
    } else {
        statements.join("\n")
    }
}

fn rubric_versions(gates: &StateGates) -> Option<String> {
    let versions: BTreeSet<&str> = gates.semantic.iter().map(|g| g.rubric.version.as_str()).collect();
    if versions.is_empty() {
        None
    } else {
        Some(versions.into_iter().collect::<Vec<_>>().join(","))
    }
}
