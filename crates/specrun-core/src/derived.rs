//! Amendments and derived runs
//!
//! A derived run re-enters the pipeline against an immutable base run.
//! Artifacts untouched by the amended stable IDs are carried over verbatim
//! (same content, same hash) with `base_run_id` set; everything in the
//! affected closure is regenerated from the earliest state producing it.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::json;
use specrun_artifact::types::{AmendedItem, AmendmentContent};
use specrun_artifact::{
    Artifact, ArtifactType, Clarification, RunHandle, RunId, RunMetadata, RunState, StableIds,
    StoreError,
};
use tracing::{debug, info};

use crate::collaboration::{CollaborationLog, ContentRef, Decision, NewEvent, TranscriptStore};
use crate::error::{DerivedRunError, LogError, OrchestratorError};
use crate::orchestrator::{Orchestrator, RunOutcome};

/// A change request against a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Amendment {
    pub base_run_id: RunId,
    #[serde(default)]
    pub amended_items: Vec<AmendedItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Amendment {
    #[must_use]
    pub fn new(base_run_id: RunId, amended_items: Vec<AmendedItem>) -> Self {
        Self {
            base_run_id,
            amended_items,
            reason: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Parse an amendment document
    ///
    /// # Errors
    /// [`DerivedRunError::AmendmentFormat`] on malformed JSON or unknown fields
    pub fn from_json_str(json: &str) -> Result<Self, DerivedRunError> {
        Ok(serde_json::from_str(json)?)
    }

    /// # Errors
    /// [`DerivedRunError::AmendmentIo`] if the file cannot be read, otherwise
    /// as [`Amendment::from_json_str`]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, DerivedRunError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DerivedRunError::AmendmentIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    #[must_use]
    pub fn amended_ids(&self) -> BTreeSet<&str> {
        self.amended_items.iter().map(|item| item.id.as_str()).collect()
    }

    /// Content of the `Amendment` artifact
    #[must_use]
    pub fn to_content(&self) -> AmendmentContent {
        AmendmentContent {
            base_run_id: self.base_run_id.as_str().to_string(),
            amended_items: self.amended_items.clone(),
            reason: self.reason.clone(),
            raw_response: None,
        }
    }
}

/// Artifact IDs invalidated by amending `amended_ids`
///
/// An artifact is affected when its content mentions an amended ID, or when
/// any of its `input_refs` names an affected artifact. Amendments never
/// participate.
#[must_use]
pub fn affected_closure(artifacts: &[Artifact], amended_ids: &BTreeSet<&str>) -> BTreeSet<String> {
    let candidates: Vec<&Artifact> = artifacts
        .iter()
        .filter(|a| a.artifact_type() != ArtifactType::Amendment)
        .collect();

    let mut affected: BTreeSet<String> = candidates
        .iter()
        .filter(|a| {
            let ids = StableIds::extract(&a.content);
            amended_ids.iter().any(|id| ids.mentions(id))
        })
        .map(|a| a.artifact_id().to_string())
        .collect();

    loop {
        let before = affected.len();
        for artifact in &candidates {
            if affected.contains(artifact.artifact_id()) {
                continue;
            }
            if artifact
                .provenance
                .input_refs
                .iter()
                .any(|input| affected.contains(&input.artifact_id))
            {
                affected.insert(artifact.artifact_id().to_string());
            }
        }
        if affected.len() == before {
            return affected;
        }
    }
}

/// Amended items carried from the base run, overridden by the new ones
fn combined_items(base: Option<&AmendmentContent>, amendment: &Amendment) -> Vec<AmendedItem> {
    let new_ids = amendment.amended_ids();
    let mut items: Vec<AmendedItem> = base
        .map(|b| {
            b.amended_items
                .iter()
                .filter(|item| !new_ids.contains(item.id.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    items.extend(amendment.amended_items.iter().cloned());
    items
}

impl Orchestrator {
    /// Start a run derived from `base_run_id` with `amendment` applied
    ///
    /// # Errors
    /// [`DerivedRunError::BaseRunMismatch`] if the amendment names another
    /// run, [`DerivedRunError::UnsupportedBaseRun`] if the base run is still
    /// active or lacks its pipeline input, store failures otherwise
    pub async fn start_derived_run(
        &self,
        base_run_id: &RunId,
        amendment: &Amendment,
    ) -> Result<RunOutcome, DerivedRunError> {
        if &amendment.base_run_id != base_run_id {
            return Err(DerivedRunError::BaseRunMismatch {
                expected: base_run_id.clone(),
                found: amendment.base_run_id.clone(),
            });
        }
        let base = self.store.read_metadata(base_run_id)?;
        if !base.is_terminal() {
            return Err(DerivedRunError::UnsupportedBaseRun {
                run_id: base_run_id.clone(),
                reason: format!("run is still in {}", base.state),
            });
        }
        let Some(pipeline_input) = base.pipeline_input.clone() else {
            return Err(DerivedRunError::UnsupportedBaseRun {
                run_id: base_run_id.clone(),
                reason: "no pipeline input recorded".to_string(),
            });
        };
        self.check_executors()?;

        let amendment_content = serde_json::to_value(AmendmentContent {
            amended_items: combined_items(base.amendment.as_ref(), amendment),
            ..amendment.to_content()
        })?;
        ArtifactType::Amendment
            .validate_content(&amendment_content)
            .map_err(|problems| StoreError::Validation {
                artifact_type: ArtifactType::Amendment,
                problems,
            })?;
        let combined: AmendmentContent = serde_json::from_value(amendment_content.clone())?;

        let base_artifacts: Vec<Artifact> = self
            .store
            .canonical_artifacts(base_run_id)?
            .into_iter()
            .filter(|a| a.artifact_type() != ArtifactType::Amendment)
            .collect();
        let affected = affected_closure(&base_artifacts, &amendment.amended_ids());
        let start_state = self.derived_start_state(&base_artifacts, &affected);
        debug!(base_run = %base_run_id, affected = ?affected, start = %start_state, "computed amendment closure");

        let mut metadata = RunMetadata::new(RunId::generate(), &self.config.name, &self.config.policy_version)
            .with_input(pipeline_input);
        metadata.state = start_state;
        metadata.base_run_id = Some(base_run_id.clone());
        metadata.amendment = Some(combined);
        let handle = self.store.initialize_run(metadata)?;
        let log = CollaborationLog::open(&handle)?;

        let clarifications = copy_clarifications(&handle, &base, self.store.run_dir(base_run_id).as_path())?;
        self.store.update_metadata(&handle, move |m| m.clarifications = clarifications)?;

        let amendment_artifact = Artifact::builder(ArtifactType::Amendment, handle.run_id().clone())
            .base_run(Some(base_run_id.clone()))
            .build(amendment_content);
        self.store.write_artifact(&handle, &amendment_artifact)?;

        let mut reused = Vec::new();
        for artifact in base_artifacts.iter().filter(|a| !affected.contains(a.artifact_id())) {
            let mut copy = artifact.clone();
            copy.provenance.run_id = handle.run_id().clone();
            copy.provenance.base_run_id = Some(base_run_id.clone());
            self.store.write_artifact(&handle, &copy)?;
            reused.push(copy.artifact_id().to_string());
        }

        info!(
            run_id = %handle.run_id(),
            base_run = %base_run_id,
            reused = reused.len(),
            affected = affected.len(),
            start = %start_state,
            "derived run started"
        );
        log.append(
            &handle,
            NewEvent::decision(
                Decision::new("derived_run_started", start_state, &self.config.policy_version).with_detail(json!({
                    "base_run_id": base_run_id,
                    "amended_ids": amendment.amended_ids(),
                    "affected": affected,
                    "reused": reused,
                })),
                format!("derived from {base_run_id}, re-entering at {start_state}"),
            )
            .with_references(vec![amendment_artifact.artifact_id().to_string()]),
        )?;

        Ok(self.drive(&handle, &log).await?)
    }

    /// Earliest state that regenerates an affected artifact or produces one
    /// the base run never reached; `Review` re-gates a fully reused run
    fn derived_start_state(&self, base_artifacts: &[Artifact], affected: &BTreeSet<String>) -> RunState {
        let earliest_affected = base_artifacts
            .iter()
            .filter(|a| affected.contains(a.artifact_id()))
            .filter_map(|a| self.config.state_producing(a.artifact_type()))
            .min();
        let reused: BTreeSet<ArtifactType> = base_artifacts
            .iter()
            .filter(|a| !affected.contains(a.artifact_id()))
            .map(Artifact::artifact_type)
            .collect();
        let earliest_missing = RunState::PIPELINE.into_iter().find(|state| {
            (*state == RunState::Clarify && !reused.contains(&ArtifactType::InfoSufficiencyAssessment))
                || self
                    .config
                    .roles_for(*state)
                    .iter()
                    .any(|role| !reused.contains(&role.output()))
        });
        [earliest_affected, earliest_missing]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(RunState::Review)
    }
}

/// Copy the base run's clarification transcripts into the derived run
fn copy_clarifications(
    handle: &RunHandle,
    base: &RunMetadata,
    base_dir: &Path,
) -> Result<Vec<Clarification>, OrchestratorError> {
    let mut copied = Vec::with_capacity(base.clarifications.len());
    for clarification in &base.clarifications {
        let question_ref = copy_blob(handle, base_dir, &clarification.question_ref)?;
        let answer_ref = copy_blob(handle, base_dir, &clarification.answer_ref)?;
        copied.push(Clarification {
            question_ref: question_ref.path,
            answer_ref: answer_ref.path,
            confidence_before: clarification.confidence_before,
        });
    }
    Ok(copied)
}

fn copy_blob(handle: &RunHandle, base_dir: &Path, path: &str) -> Result<ContentRef, OrchestratorError> {
    let source = base_dir.join(path);
    let text = std::fs::read_to_string(&source).map_err(|e| LogError::io(&source, e))?;
    let name = Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);
    Ok(TranscriptStore::write(handle, name, &text)?)
}
