//! Envelope hard-gate checks
//!
//! Structural checks every artifact must pass before it is written and
//! again whenever the audit engine evaluates a run.

use crate::artifact::{Artifact, SCHEMA_VERSION};

/// Problems with identity, provenance, hash or typed content; empty when valid
#[must_use]
pub fn check_envelope(artifact: &Artifact) -> Vec<String> {
    let mut problems = Vec::new();
    let identity = &artifact.identity;
    let provenance = &artifact.provenance;

    if identity.artifact_id.trim().is_empty() {
        problems.push("identity.artifact_id is empty".to_string());
    }
    if identity.schema_version != SCHEMA_VERSION {
        problems.push(format!(
            "identity.schema_version `{}` is not supported (expected {SCHEMA_VERSION})",
            identity.schema_version
        ));
    }
    if identity.revision == 0 {
        problems.push("identity.revision must start at 1".to_string());
    }
    if provenance.created_by_role.trim().is_empty() {
        problems.push("provenance.created_by_role is empty".to_string());
    }
    if provenance.created_by_instance_id.trim().is_empty() {
        problems.push("provenance.created_by_instance_id is empty".to_string());
    }
    if provenance.model_ref.provider.trim().is_empty() {
        problems.push("provenance.model_ref.provider is empty".to_string());
    }
    for (i, input) in provenance.input_refs.iter().enumerate() {
        if input.artifact_id.trim().is_empty() {
            problems.push(format!("provenance.input_refs[{i}].artifact_id is empty"));
        }
    }
    if provenance.base_run_id.as_ref() == Some(&provenance.run_id) {
        problems.push("provenance.base_run_id equals run_id".to_string());
    }
    if !artifact.verify() {
        problems.push(format!(
            "content_hash {} does not match recomputed {}",
            artifact.content_hash,
            artifact.recompute_hash()
        ));
    }
    if let Err(content_problems) = identity.artifact_type.validate_content(&artifact.content) {
        problems.extend(
            content_problems
                .into_iter()
                .map(|p| format!("content: {p}")),
        );
    }
    problems
}
