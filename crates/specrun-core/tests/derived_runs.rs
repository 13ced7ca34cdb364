//! Derived runs reuse what an amendment leaves untouched

use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;
use specrun_artifact::types::AmendedItem;
use specrun_artifact::{ArtifactType, RunId, RunMetadata, RunState};
use specrun_core::{Amendment, DerivedRunError, Role};
use specrun_test_utils::{
    dry_run_orchestrator, orchestrator, registry_with, store, task_tracker_input, temp_dir,
    CountingExecutor,
};

fn amend(base: &RunId, id: &str, value: &str) -> Amendment {
    Amendment::new(
        base.clone(),
        vec![AmendedItem {
            id: id.to_string(),
            value: json!(value),
        }],
    )
    .with_reason("stakeholder follow-up")
}

#[tokio::test]
async fn only_the_affected_closure_is_regenerated() {
    let dir = temp_dir();
    let base = dry_run_orchestrator(&dir).start(task_tracker_input()).await.unwrap();
    assert_eq!(base.final_state, RunState::Final);

    let counting = Arc::new(CountingExecutor::dry_run());
    let derived_orchestrator = orchestrator(&dir, registry_with(counting.clone()));
    let amendment = amend(&base.run_id, "TASK-0001", "Split reminders into their own task");
    let derived = derived_orchestrator
        .start_derived_run(&base.run_id, &amendment)
        .await
        .unwrap();

    assert_eq!(derived.final_state, RunState::Final);
    assert_ne!(derived.run_id, base.run_id);
    assert_eq!(counting.calls(Role::Planner), 1);
    assert_eq!(counting.calls(Role::Reviewer), 1);
    for untouched in [Role::IntakeAnalyst, Role::BusinessAnalyst, Role::Architect, Role::Designer, Role::TestPlanner] {
        assert_eq!(counting.calls(untouched), 0, "{untouched} regenerated");
    }

    let store = store(&dir);
    let metadata = store.read_metadata(&derived.run_id).unwrap();
    assert_eq!(metadata.base_run_id.as_ref(), Some(&base.run_id));
    assert!(metadata.amendment.is_some());

    let base_artifacts = store.canonical_artifacts(&base.run_id).unwrap();
    let derived_artifacts = store.canonical_artifacts(&derived.run_id).unwrap();
    for artifact in &derived_artifacts {
        assert_eq!(
            artifact.provenance.base_run_id.as_ref(),
            Some(&base.run_id),
            "{} lacks base_run_id",
            artifact.artifact_id()
        );
    }

    let hash_of = |artifacts: &[specrun_artifact::Artifact], t: ArtifactType| {
        artifacts.iter().find(|a| a.artifact_type() == t).map(|a| a.content_hash)
    };
    for reused in [ArtifactType::ProblemBrief, ArtifactType::BusinessRequirements, ArtifactType::TestPlan] {
        assert_eq!(hash_of(&base_artifacts, reused), hash_of(&derived_artifacts, reused));
    }
    assert!(derived_artifacts
        .iter()
        .any(|a| a.artifact_type() == ArtifactType::Amendment));
    assert!(derived_artifacts
        .iter()
        .any(|a| a.artifact_type() == ArtifactType::WorkBreakdown));
}

#[tokio::test]
async fn unaffected_amendment_only_regates_review() {
    let dir = temp_dir();
    let base = dry_run_orchestrator(&dir).start(task_tracker_input()).await.unwrap();

    let counting = Arc::new(CountingExecutor::dry_run());
    let derived = orchestrator(&dir, registry_with(counting.clone()))
        .start_derived_run(&base.run_id, &amend(&base.run_id, "ZZZ-0001", "unused"))
        .await
        .unwrap();

    assert_eq!(derived.final_state, RunState::Final);
    assert_eq!(counting.total_calls(), 0);
}

#[tokio::test]
async fn amendment_must_name_the_base_run() {
    let dir = temp_dir();
    let base = dry_run_orchestrator(&dir).start(task_tracker_input()).await.unwrap();

    let err = dry_run_orchestrator(&dir)
        .start_derived_run(&base.run_id, &amend(&RunId::generate(), "REQ-0001", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, DerivedRunError::BaseRunMismatch { .. }));
}

#[tokio::test]
async fn active_base_run_is_unsupported() {
    let dir = temp_dir();
    let run_id = RunId::generate();
    let handle = store(&dir)
        .initialize_run(RunMetadata::new(run_id.clone(), "default", "v1"))
        .unwrap();
    drop(handle);

    let err = dry_run_orchestrator(&dir)
        .start_derived_run(&run_id, &amend(&run_id, "REQ-0001", "x"))
        .await
        .unwrap_err();
    assert!(matches!(err, DerivedRunError::UnsupportedBaseRun { .. }));
    assert_eq!(err.kind(), "unsupported_base_run");
}

#[tokio::test]
async fn finished_run_without_recorded_input_is_unsupported() {
    let dir = temp_dir();
    let base = dry_run_orchestrator(&dir).start(task_tracker_input()).await.unwrap();
    assert_eq!(base.final_state, RunState::Final);

    // runs written before inputs were recorded carry no pipeline_input
    let path = store(&dir).run_dir(&base.run_id).join("metadata.json");
    let mut raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    raw.as_object_mut().unwrap().remove("pipeline_input");
    std::fs::write(&path, serde_json::to_vec_pretty(&raw).unwrap()).unwrap();
    assert!(store(&dir).read_metadata(&base.run_id).unwrap().pipeline_input.is_none());

    let counting = Arc::new(CountingExecutor::dry_run());
    let err = orchestrator(&dir, registry_with(counting.clone()))
        .start_derived_run(&base.run_id, &amend(&base.run_id, "TASK-0001", "x"))
        .await
        .unwrap_err();

    assert!(matches!(err, DerivedRunError::UnsupportedBaseRun { .. }));
    assert_eq!(err.kind(), "unsupported_base_run");
    assert_eq!(counting.total_calls(), 0);
    assert_eq!(std::fs::read_dir(dir.path().join("runs")).unwrap().count(), 1);
}
