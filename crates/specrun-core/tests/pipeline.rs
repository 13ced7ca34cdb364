//! End-to-end runs against the dry-run and scripted executors

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use specrun_artifact::types::TraceabilityMatrixContent;
use specrun_artifact::{ArtifactType, Disposition, PipelineInput, RunState};
use specrun_audit::traceability::REPORT_FILE;
use specrun_core::{
    CollaborationLog, EventType, ExecutorRegistry, InstancePattern, InstancePolicy,
    OnInsufficient, Orchestrator, Resolution, Role,
};
use specrun_test_utils::{
    dry_run_orchestrator, registry_with, task_tracker_input, temp_dir, test_config, PendingExecutor,
    ScriptedExecutor,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn dry_run_reaches_final_with_clean_audits() {
    let dir = temp_dir();
    let orchestrator = dry_run_orchestrator(&dir);

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Final);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(outcome.stop_reason, None);

    let canonical = orchestrator.store().canonical_artifacts(&outcome.run_id).unwrap();
    for (_, role) in orchestrator.config().all_roles() {
        let produced = canonical.iter().filter(|a| a.artifact_type() == role.output()).count();
        assert_eq!(produced, 1, "{role} output");
    }
    assert!(canonical
        .iter()
        .any(|a| a.artifact_type() == ArtifactType::InfoSufficiencyAssessment));

    let records = orchestrator.audit_records(&outcome.run_id).unwrap();
    assert!(!records.is_empty());
    let failures: Vec<String> = records
        .iter()
        .filter(|r| !r.result.passed)
        .map(|r| r.result.describe())
        .collect();
    assert!(failures.is_empty(), "unexpected gate failures: {failures:?}");

    let run_dir = orchestrator.store().run_dir(&outcome.run_id);
    assert!(CollaborationLog::verify_integrity(&run_dir).unwrap() > 0);
    let matrix: TraceabilityMatrixContent = orchestrator
        .store()
        .read_report(&outcome.run_id, REPORT_FILE)
        .unwrap();
    assert!(matrix.gaps.is_empty());

    let metadata = orchestrator.store().read_metadata(&outcome.run_id).unwrap();
    assert_eq!(metadata.execution_successful, Some(true));
    assert!(metadata.pending_revision.is_empty());
}

#[tokio::test]
async fn undersized_input_stops_at_clarify() {
    let dir = temp_dir();
    let orchestrator = dry_run_orchestrator(&dir);

    let outcome = orchestrator.start(PipelineInput::new("Build it")).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Stopped);
    assert_eq!(outcome.exit_code(), 2);
    let reason = outcome.stop_reason.unwrap();
    assert!(reason.contains("information sufficiency"), "{reason}");
    assert!(reason.contains("scope"), "{reason}");

    let metadata = orchestrator.store().read_metadata(&outcome.run_id).unwrap();
    assert!(metadata
        .latest_canonical(ArtifactType::InfoSufficiencyAssessment)
        .is_some());
    assert!(metadata.latest_canonical(ArtifactType::AssumptionLedger).is_none());
}

#[tokio::test]
async fn clarify_retry_reassesses_with_answers() {
    let dir = temp_dir();
    let config = test_config(&dir).with_on_insufficient(OnInsufficient::ClarifyRetry);
    let orchestrator = Orchestrator::new(config, ExecutorRegistry::dry_run());

    let outcome = orchestrator.start(PipelineInput::new("Build it")).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Final);
    let metadata = orchestrator.store().read_metadata(&outcome.run_id).unwrap();
    assert_eq!(metadata.clarifications.len(), 1);
    assert!(metadata.clarifications[0].confidence_before < 0.6);
    let isa = metadata
        .latest_canonical(ArtifactType::InfoSufficiencyAssessment)
        .unwrap();
    assert_eq!(isa.revision, 2);

    let events = CollaborationLog::read_all(&orchestrator.store().run_dir(&outcome.run_id)).unwrap();
    let asked = events
        .iter()
        .filter(|e| e.event_type == EventType::StakeholderQuestionAsked)
        .count();
    let answered: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == EventType::StakeholderAnswerReceived)
        .collect();
    assert_eq!(asked, 1);
    assert_eq!(answered.len(), 1);
    assert!(answered[0].content_ref.is_some());
}

#[tokio::test]
async fn throttled_role_recovers_within_retry_budget() {
    let dir = temp_dir();
    let executor = Arc::new(ScriptedExecutor::new().throttle(Role::Architect, 2));
    let orchestrator = Orchestrator::new(test_config(&dir), registry_with(executor.clone()));

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Final);
    assert_eq!(executor.calls(Role::Architect), 3);
}

#[tokio::test]
async fn fatal_executor_error_stops_the_run() {
    let dir = temp_dir();
    let executor = Arc::new(ScriptedExecutor::new().fatal(Role::Planner, "model unavailable"));
    let orchestrator = Orchestrator::new(test_config(&dir), registry_with(executor.clone()));

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Stopped);
    let reason = outcome.stop_reason.unwrap();
    assert!(reason.contains("Planner"), "{reason}");
    assert_eq!(executor.calls(Role::Planner), 1);
}

#[tokio::test]
async fn invalid_output_counts_against_state_retries() {
    let dir = temp_dir();
    let executor = Arc::new(ScriptedExecutor::new().content(Role::Designer, json!({"bogus": true})));
    let orchestrator = Orchestrator::new(test_config(&dir), registry_with(executor.clone()));

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Stopped);
    assert_eq!(executor.calls(Role::Designer), 3);
    let metadata = orchestrator.store().read_metadata(&outcome.run_id).unwrap();
    assert!(metadata.latest_canonical(ArtifactType::ImplementationDesign).is_none());
}

#[tokio::test]
async fn dangling_reference_is_revised_then_stops() {
    let dir = temp_dir();
    let executor = Arc::new(ScriptedExecutor::new().content(
        Role::NfrAnalyst,
        json!({"categories": [{"id": "NFR-0001", "traces": ["ZZZ-0042"]}]}),
    ));
    let orchestrator = Orchestrator::new(test_config(&dir), registry_with(executor.clone()));

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Stopped);
    assert!(outcome.stop_reason.unwrap().contains("ZZZ-0042"));
    assert_eq!(executor.calls(Role::NfrAnalyst), 3);
    assert_eq!(executor.calls(Role::BusinessAnalyst), 1);

    let metadata = orchestrator.store().read_metadata(&outcome.run_id).unwrap();
    let nfr = metadata
        .latest_canonical(ArtifactType::NonFunctionalRequirements)
        .unwrap();
    assert_eq!(nfr.revision, 3);

    let attempts: Vec<u32> = orchestrator
        .audit_records(&outcome.run_id)
        .unwrap()
        .into_iter()
        .filter(|r| r.result.gate_name == "referential_integrity" && !r.result.passed)
        .map(|r| r.attempt)
        .collect();
    assert_eq!(attempts, vec![0, 1, 2]);
}

#[tokio::test]
async fn alternatives_persist_every_candidate() {
    let dir = temp_dir();
    let config = test_config(&dir)
        .with_instance_policy(Role::Planner, InstancePolicy::new(InstancePattern::Alternatives { count: 3 }));
    let orchestrator = Orchestrator::new(config, ExecutorRegistry::dry_run());

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Final);
    let alternatives: Vec<_> = outcome
        .artifacts
        .iter()
        .filter(|e| e.artifact_type == ArtifactType::WorkBreakdown && e.disposition == Disposition::Alternative)
        .collect();
    assert_eq!(alternatives.len(), 3);

    let canonical = orchestrator
        .store()
        .canonical_artifacts(&outcome.run_id)
        .unwrap()
        .into_iter()
        .find(|a| a.artifact_type() == ArtifactType::WorkBreakdown)
        .unwrap();
    assert_eq!(canonical.provenance.created_by_instance_id, "Planner#0");
}

#[tokio::test]
async fn merged_critiques_are_authored_by_the_orchestrator() {
    let dir = temp_dir();
    let config = test_config(&dir).with_instance_policy(
        Role::Planner,
        InstancePolicy::new(InstancePattern::GenerateAndCritique { critics: 2 }).with_resolution(Resolution::Merge),
    );
    let orchestrator = Orchestrator::new(config, ExecutorRegistry::dry_run());

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Final);
    let canonical = orchestrator
        .store()
        .canonical_artifacts(&outcome.run_id)
        .unwrap()
        .into_iter()
        .find(|a| a.artifact_type() == ArtifactType::WorkBreakdown)
        .unwrap();
    assert_eq!(canonical.provenance.created_by_role, "orchestrator");
    let alternatives = outcome
        .artifacts
        .iter()
        .filter(|e| e.disposition == Disposition::Alternative)
        .count();
    assert_eq!(alternatives, 3);
}

#[tokio::test]
async fn cancellation_stops_the_run() {
    let dir = temp_dir();
    let token = CancellationToken::new();
    let orchestrator = Orchestrator::new(
        test_config(&dir),
        registry_with(Arc::new(PendingExecutor { role: Role::Architect })),
    )
    .with_cancellation(token.clone());

    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });
    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Stopped);
    assert_eq!(outcome.stop_reason.as_deref(), Some("cancelled"));
    let metadata = orchestrator.store().read_metadata(&outcome.run_id).unwrap();
    assert!(metadata
        .latest_canonical(ArtifactType::ArchitectureDecisionRecordSet)
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn run_timeout_stops_the_run() {
    let dir = temp_dir();
    let config = test_config(&dir).with_timeout(Duration::from_secs(30));
    let orchestrator = Orchestrator::new(config, registry_with(Arc::new(PendingExecutor { role: Role::SpecWriter })));

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.final_state, RunState::Stopped);
    assert_eq!(outcome.stop_reason.as_deref(), Some("timeout"));
    let events = CollaborationLog::read_all(&orchestrator.store().run_dir(&outcome.run_id)).unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::OrchestratorDecisionMade);
    assert_eq!(last.decision.as_ref().unwrap().kind, "stop");
}

#[tokio::test(start_paused = true)]
async fn sub_second_timeout_waits_its_full_duration() {
    let dir = temp_dir();
    let config = test_config(&dir).with_timeout(Duration::from_millis(900));
    let orchestrator = Orchestrator::new(config, registry_with(Arc::new(PendingExecutor { role: Role::SpecWriter })));
    let started = tokio::time::Instant::now();

    let outcome = orchestrator.start(task_tracker_input()).await.unwrap();

    assert_eq!(outcome.stop_reason.as_deref(), Some("timeout"));
    assert!(started.elapsed() >= Duration::from_millis(900), "fired after {:?}", started.elapsed());
    let metadata = orchestrator.store().read_metadata(&outcome.run_id).unwrap();
    assert!(metadata.latest_canonical(ArtifactType::ProblemBrief).is_some());
}

#[tokio::test]
async fn zero_timeout_is_rejected_before_the_run_starts() {
    let dir = temp_dir();
    let config = test_config(&dir).with_timeout(Duration::ZERO);
    let err = Orchestrator::new(config, ExecutorRegistry::dry_run())
        .start(task_tracker_input())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "config");
}
