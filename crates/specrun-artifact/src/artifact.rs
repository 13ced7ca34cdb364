//! Artifact envelope
//!
//! An [`Artifact`] is typed content wrapped with identity, provenance and
//! quality metadata. The content hash is computed over canonical JSON of
//! `content` only, so envelope fields may be rewritten (for example
//! `base_run_id` on carried-over artifacts) without changing it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::artifact_type::ArtifactType;
use crate::hash::ContentHash;
use crate::run::RunId;
use crate::types::ArtifactContent;

/// Content model version written by this crate
pub const SCHEMA_VERSION: &str = "1.0";

/// Whether an artifact is the run's canonical copy or a retained alternative
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    #[default]
    Canonical,
    Alternative,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIdentity {
    pub artifact_id: String,
    pub artifact_type: ArtifactType,
    pub schema_version: String,
    /// Starts at 1; incremented on each canonical rewrite of the same type
    pub revision: u32,
}

/// An artifact consumed while producing another
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InputRef {
    pub artifact_id: String,
    pub content_hash: ContentHash,
}

/// Opaque descriptor of whatever produced the content; never holds secrets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRef {
    pub provider: String,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
}

impl ModelRef {
    #[must_use]
    pub fn new(provider: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model_name: model_name.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Descriptor for content authored by the orchestrator itself
    #[must_use]
    pub fn orchestrator() -> Self {
        Self::new("specrun", "orchestrator")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_run_id: Option<RunId>,
    pub created_at: DateTime<Utc>,
    pub created_by_role: String,
    pub created_by_instance_id: String,
    #[serde(default)]
    pub input_refs: Vec<InputRef>,
    pub model_ref: ModelRef,
}

/// Free-form quality lists, checked for presence only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityMetadata {
    pub assumptions: Vec<String>,
    pub open_questions: Vec<String>,
    pub risks: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

/// A typed, hashed, provenance-bearing document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub identity: ArtifactIdentity,
    pub provenance: Provenance,
    pub content: Value,
    #[serde(default)]
    pub quality_metadata: QualityMetadata,
    pub content_hash: ContentHash,
    #[serde(default)]
    pub disposition: Disposition,
}

impl Artifact {
    /// Wrap `content`, computing its hash
    #[must_use]
    pub fn new(identity: ArtifactIdentity, provenance: Provenance, content: Value) -> Self {
        let content_hash = ContentHash::of_json(&content);
        Self {
            identity,
            provenance,
            content,
            quality_metadata: QualityMetadata::default(),
            content_hash,
            disposition: Disposition::Canonical,
        }
    }

    /// Start building an artifact of `artifact_type` for `run_id`
    #[must_use]
    pub fn builder(artifact_type: ArtifactType, run_id: RunId) -> ArtifactBuilder {
        ArtifactBuilder::new(artifact_type, run_id)
    }

    #[inline]
    #[must_use]
    pub fn artifact_type(&self) -> ArtifactType {
        self.identity.artifact_type
    }

    #[inline]
    #[must_use]
    pub fn artifact_id(&self) -> &str {
        &self.identity.artifact_id
    }

    #[inline]
    #[must_use]
    pub fn revision(&self) -> u32 {
        self.identity.revision
    }

    #[inline]
    #[must_use]
    pub fn is_canonical(&self) -> bool {
        self.disposition == Disposition::Canonical
    }

    /// Hash of the current content
    #[must_use]
    pub fn recompute_hash(&self) -> ContentHash {
        ContentHash::of_json(&self.content)
    }

    /// Whether the stored hash matches the content
    #[must_use]
    pub fn verify(&self) -> bool {
        self.recompute_hash() == self.content_hash
    }

    /// Reference to this artifact for another artifact's `input_refs`
    #[must_use]
    pub fn input_ref(&self) -> InputRef {
        InputRef {
            artifact_id: self.identity.artifact_id.clone(),
            content_hash: self.content_hash,
        }
    }

    /// Deserialize content into its typed model
    ///
    /// # Errors
    /// Returns error if `T` is not this artifact's model or the content does not fit it
    pub fn typed_content<T: ArtifactContent>(&self) -> Result<T, serde_json::Error> {
        if T::ARTIFACT_TYPE != self.artifact_type() {
            return Err(serde::de::Error::custom(format!(
                "{} content requested from a {} artifact",
                T::ARTIFACT_TYPE,
                self.artifact_type()
            )));
        }
        serde_json::from_value(self.content.clone())
    }

    /// Replace content and recompute the hash
    pub fn set_content(&mut self, content: Value) {
        self.content_hash = ContentHash::of_json(&content);
        self.content = content;
    }
}

/// Builder for [`Artifact`]
#[derive(Debug, Clone)]
pub struct ArtifactBuilder {
    artifact_type: ArtifactType,
    artifact_id: Option<String>,
    revision: u32,
    run_id: RunId,
    base_run_id: Option<RunId>,
    role: String,
    instance_id: String,
    input_refs: Vec<InputRef>,
    model_ref: ModelRef,
    quality_metadata: QualityMetadata,
    disposition: Disposition,
}

impl ArtifactBuilder {
    fn new(artifact_type: ArtifactType, run_id: RunId) -> Self {
        Self {
            artifact_type,
            artifact_id: None,
            revision: 1,
            run_id,
            base_run_id: None,
            role: "orchestrator".to_string(),
            instance_id: "orchestrator".to_string(),
            input_refs: Vec::new(),
            model_ref: ModelRef::orchestrator(),
            quality_metadata: QualityMetadata::default(),
            disposition: Disposition::Canonical,
        }
    }

    /// Override the artifact ID (defaults to the type name)
    #[must_use]
    pub fn artifact_id(mut self, id: impl Into<String>) -> Self {
        self.artifact_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    #[must_use]
    pub fn base_run(mut self, base_run_id: Option<RunId>) -> Self {
        self.base_run_id = base_run_id;
        self
    }

    #[must_use]
    pub fn created_by(mut self, role: impl Into<String>, instance_id: impl Into<String>) -> Self {
        self.role = role.into();
        self.instance_id = instance_id.into();
        self
    }

    #[must_use]
    pub fn inputs(mut self, input_refs: Vec<InputRef>) -> Self {
        self.input_refs = input_refs;
        self
    }

    #[must_use]
    pub fn model(mut self, model_ref: ModelRef) -> Self {
        self.model_ref = model_ref;
        self
    }

    #[must_use]
    pub fn quality(mut self, quality_metadata: QualityMetadata) -> Self {
        self.quality_metadata = quality_metadata;
        self
    }

    #[must_use]
    pub fn disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    /// Finish with `content`, computing the hash
    #[must_use]
    pub fn build(self, content: Value) -> Artifact {
        let identity = ArtifactIdentity {
            artifact_id: self
                .artifact_id
                .unwrap_or_else(|| self.artifact_type.as_str().to_string()),
            artifact_type: self.artifact_type,
            schema_version: SCHEMA_VERSION.to_string(),
            revision: self.revision,
        };
        let provenance = Provenance {
            run_id: self.run_id,
            base_run_id: self.base_run_id,
            created_at: Utc::now(),
            created_by_role: self.role,
            created_by_instance_id: self.instance_id,
            input_refs: self.input_refs,
            model_ref: self.model_ref,
        };
        let mut artifact = Artifact::new(identity, provenance, content);
        artifact.quality_metadata = self.quality_metadata;
        artifact.disposition = self.disposition;
        artifact
    }
}
