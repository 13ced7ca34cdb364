//! Store-level properties: hashing, manifest order and revision discipline

use proptest::prelude::*;
use serde_json::{json, Value};
use specrun_artifact::{
    Artifact, ArtifactStore, ArtifactType, ContentHash, RunId, RunMetadata, StoreError,
};
use tempfile::TempDir;

const WRITE_ORDER: [ArtifactType; 5] = [
    ArtifactType::ProblemBrief,
    ArtifactType::AssumptionLedger,
    ArtifactType::BusinessRequirements,
    ArtifactType::ArchitectureDecisionRecordSet,
    ArtifactType::WorkBreakdown,
];

fn empty_content(artifact_type: ArtifactType) -> Value {
    match artifact_type {
        ArtifactType::ProblemBrief => json!({"goals": []}),
        ArtifactType::AssumptionLedger => json!({"assumptions": []}),
        ArtifactType::BusinessRequirements => json!({"functional_requirements": []}),
        ArtifactType::ArchitectureDecisionRecordSet => json!({"decisions": []}),
        _ => json!({"tasks": []}),
    }
}

#[test]
fn manifest_order_matches_write_order() {
    let tmp = TempDir::new().unwrap();
    let store = ArtifactStore::new(tmp.path());
    let handle = store
        .initialize_run(RunMetadata::new(RunId::generate(), "order", "v1"))
        .unwrap();

    for t in WRITE_ORDER {
        let artifact = Artifact::builder(t, handle.run_id().clone())
            .created_by("tester", "tester#0")
            .build(empty_content(t));
        store.write_artifact(&handle, &artifact).unwrap();
    }

    let manifest = store.list_artifacts(handle.run_id()).unwrap();
    let types: Vec<ArtifactType> = manifest.iter().map(|e| e.artifact_type).collect();
    assert_eq!(types, WRITE_ORDER.to_vec());

    // The cached handle metadata and the on-disk copy agree.
    assert_eq!(handle.metadata().artifacts_manifest, manifest);
}

#[test]
fn rewrite_without_revision_increment_rejected() {
    let tmp = TempDir::new().unwrap();
    let store = ArtifactStore::new(tmp.path());
    let handle = store
        .initialize_run(RunMetadata::new(RunId::generate(), "rev", "v1"))
        .unwrap();
    let first = Artifact::builder(ArtifactType::TestPlan, handle.run_id().clone())
        .build(json!({"test_suites": [{"id": "TEST-0001"}]}));
    store.write_artifact(&handle, &first).unwrap();

    let renamed = Artifact::builder(ArtifactType::TestPlan, handle.run_id().clone())
        .artifact_id("OtherPlan")
        .revision(2)
        .build(json!({"test_suites": []}));
    let err = store.write_artifact(&handle, &renamed).unwrap_err();
    assert_eq!(err.kind(), "validation");
}

fn json_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,12}".prop_map(Value::from),
    ]
}

fn json_tree() -> impl Strategy<Value = Value> {
    json_leaf().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn stored_hash_matches_recomputed(title in "[A-Za-z ]{1,20}", extra in json_tree()) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let handle = store
            .initialize_run(RunMetadata::new(RunId::generate(), "prop", "v1"))
            .unwrap();
        let content = json!({
            "title": title,
            "goals": [{"id": "OBJ-0001", "detail": extra}],
        });
        let artifact = Artifact::builder(ArtifactType::ProblemBrief, handle.run_id().clone())
            .build(content.clone());
        let stored = store.write_artifact(&handle, &artifact).unwrap();
        let read = store.read_artifact(handle.run_id(), ArtifactType::ProblemBrief).unwrap();
        prop_assert_eq!(stored, ContentHash::of_json(&content));
        prop_assert_eq!(read.recompute_hash(), stored);
    }

    #[test]
    fn any_content_mutation_detected(extra in json_tree()) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let handle = store
            .initialize_run(RunMetadata::new(RunId::generate(), "prop", "v1"))
            .unwrap();
        let artifact = Artifact::builder(ArtifactType::ProblemBrief, handle.run_id().clone())
            .build(json!({"goals": [{"id": "OBJ-0001", "detail": extra}]}));
        store.write_artifact(&handle, &artifact).unwrap();

        let path = store.run_dir(handle.run_id()).join("artifacts/ProblemBrief.json");
        let mut raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        raw["content"]["goals"][0]["mutated"] = json!(true);
        std::fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let err = store.read_artifact(handle.run_id(), ArtifactType::ProblemBrief).unwrap_err();
        let is_corruption = matches!(err, StoreError::Corruption { .. });
        prop_assert!(is_corruption);
    }
}
