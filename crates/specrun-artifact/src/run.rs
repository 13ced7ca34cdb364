//! Run identity, lifecycle state and persisted metadata

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::artifact::Disposition;
use crate::artifact_type::ArtifactType;
use crate::hash::ContentHash;
use crate::types::AmendmentContent;

/// Unique, lexicographically sortable run identifier
///
/// Format: `YYYYMMDD_HHMMSS_<8 lowercase hex>` in UTC.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh ID from the current UTC time
    #[must_use]
    pub fn generate() -> Self {
        Self::at(Utc::now())
    }

    /// Generate an ID for a given instant (random suffix still applies)
    #[must_use]
    pub fn at(instant: DateTime<Utc>) -> Self {
        let suffix: u32 = rand::rng().random();
        Self(format!("{}_{suffix:08x}", instant.format("%Y%m%d_%H%M%S")))
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = InvalidRunId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let well_formed = bytes.len() == 24
            && bytes[8] == b'_'
            && bytes[15] == b'_'
            && bytes[..8].iter().all(u8::is_ascii_digit)
            && bytes[9..15].iter().all(u8::is_ascii_digit)
            && bytes[16..]
                .iter()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b));
        if well_formed {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidRunId(s.to_string()))
        }
    }
}

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Malformed run identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid run id `{0}`: expected YYYYMMDD_HHMMSS_<8 hex>")]
pub struct InvalidRunId(pub String);

/// Orchestrator state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RunState {
    Intake,
    Clarify,
    Requirements,
    Architecture,
    ImplementableSpec,
    ImplementationDesign,
    Review,
    Final,
    Stopped,
}

impl RunState {
    /// Working states in pipeline order
    pub const PIPELINE: [Self; 7] = [
        Self::Intake,
        Self::Clarify,
        Self::Requirements,
        Self::Architecture,
        Self::ImplementableSpec,
        Self::ImplementationDesign,
        Self::Review,
    ];

    /// The state reached when this one passes its gates
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Intake => Some(Self::Clarify),
            Self::Clarify => Some(Self::Requirements),
            Self::Requirements => Some(Self::Architecture),
            Self::Architecture => Some(Self::ImplementableSpec),
            Self::ImplementableSpec => Some(Self::ImplementationDesign),
            Self::ImplementationDesign => Some(Self::Review),
            Self::Review => Some(Self::Final),
            Self::Final | Self::Stopped => None,
        }
    }

    /// `Final` and `Stopped` admit no further role invocation
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Final | Self::Stopped)
    }

    /// Position in the pipeline; terminal states sort last
    #[must_use]
    pub fn ordinal(self) -> usize {
        Self::PIPELINE
            .iter()
            .position(|s| *s == self)
            .unwrap_or(Self::PIPELINE.len())
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "Intake",
            Self::Clarify => "Clarify",
            Self::Requirements => "Requirements",
            Self::Architecture => "Architecture",
            Self::ImplementableSpec => "ImplementableSpec",
            Self::ImplementationDesign => "ImplementationDesign",
            Self::Review => "Review",
            Self::Final => "Final",
            Self::Stopped => "Stopped",
        }
    }
}

impl Display for RunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The original feature description a run was started from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInput {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub size: usize,
}

impl PipelineInput {
    #[must_use]
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let size = content.chars().count();
        Self {
            content,
            source: None,
            size,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// One entry of the ordered artifact manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub artifact_type: ArtifactType,
    pub artifact_id: String,
    pub revision: u32,
    pub disposition: Disposition,
    /// Path relative to the run directory
    pub file_ref: String,
    pub content_hash: ContentHash,
}

/// A clarification exchanged while the sufficiency gate was failing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clarification {
    pub question_ref: String,
    pub answer_ref: String,
    pub confidence_before: f64,
}

/// Run summary persisted as `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: RunId,
    pub pipeline_name: String,
    pub policy_version: String,
    pub state: RunState,
    /// `None` while the run is in progress
    pub execution_successful: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total_execution_time_secs: f64,
    #[serde(default)]
    pub pipeline_input: Option<PipelineInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amendment: Option<AmendmentContent>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Retries consumed by the current state
    #[serde(default)]
    pub state_retries: u32,
    /// Artifact types the current state must regenerate
    #[serde(default)]
    pub pending_revision: Vec<ArtifactType>,
    #[serde(default)]
    pub clarifications: Vec<Clarification>,
    #[serde(default)]
    pub artifacts_manifest: Vec<ManifestEntry>,
}

impl RunMetadata {
    /// Fresh metadata for a run entering `Intake`
    #[must_use]
    pub fn new(
        run_id: RunId,
        pipeline_name: impl Into<String>,
        policy_version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            pipeline_name: pipeline_name.into(),
            policy_version: policy_version.into(),
            state: RunState::Intake,
            execution_successful: None,
            created_at: now,
            updated_at: now,
            total_execution_time_secs: 0.0,
            pipeline_input: None,
            base_run_id: None,
            amendment: None,
            stop_reason: None,
            state_retries: 0,
            pending_revision: Vec::new(),
            clarifications: Vec::new(),
            artifacts_manifest: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: PipelineInput) -> Self {
        self.pipeline_input = Some(input);
        self
    }

    #[inline]
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Latest canonical manifest entry of `artifact_type`
    #[must_use]
    pub fn latest_canonical(&self, artifact_type: ArtifactType) -> Option<&ManifestEntry> {
        self.artifacts_manifest
            .iter()
            .rev()
            .find(|e| e.artifact_type == artifact_type && e.disposition == Disposition::Canonical)
    }

    /// Latest canonical entry per type, ordered by first write of that type
    #[must_use]
    pub fn canonical_entries(&self) -> Vec<&ManifestEntry> {
        let mut order: Vec<ArtifactType> = Vec::new();
        for entry in &self.artifacts_manifest {
            if entry.disposition == Disposition::Canonical && !order.contains(&entry.artifact_type) {
                order.push(entry.artifact_type);
            }
        }
        order
            .into_iter()
            .filter_map(|t| self.latest_canonical(t))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_id_format_and_parse() {
        let instant = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let id = RunId::at(instant);
        assert!(id.as_str().starts_with("20250304_050607_"));
        assert_eq!(id.as_str().parse::<RunId>().unwrap(), id);
    }

    #[test]
    fn run_ids_sort_by_time() {
        let early = RunId::at(Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap());
        let late = RunId::at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert!(early < late);
    }

    #[test]
    fn malformed_run_ids_rejected() {
        for bad in ["", "20250101_000000", "20250101-000000_abcdef12", "20250101_000000_ABCDEF12", "../../etc"] {
            assert!(bad.parse::<RunId>().is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn run_id_serde_rejects_malformed() {
        let err = serde_json::from_str::<RunId>("\"nope\"");
        assert!(err.is_err());
    }

    #[test]
    fn state_sequence_ends_in_final() {
        let mut state = RunState::Intake;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            visited.push(next);
            state = next;
        }
        assert_eq!(state, RunState::Final);
        assert_eq!(visited.len(), 8);
        assert!(RunState::Stopped.next().is_none());
    }

    #[test]
    fn metadata_serializes_in_progress_as_null() {
        let meta = RunMetadata::new(RunId::generate(), "default", "v1");
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json["execution_successful"].is_null());
        assert_eq!(json["state"], "Intake");
    }
}
