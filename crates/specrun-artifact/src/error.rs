//! Artifact store errors

use std::path::PathBuf;

use crate::artifact_type::ArtifactType;
use crate::hash::ContentHash;
use crate::run::{InvalidRunId, RunId, RunState};

/// Errors raised by [`ArtifactStore`](crate::ArtifactStore)
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run directory already exists
    #[error("run {run_id} already exists")]
    AlreadyExists { run_id: RunId },

    /// Run or artifact absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Envelope or content structurally invalid; never retried
    #[error("{artifact_type} failed validation: {}", problems.join("; "))]
    Validation {
        artifact_type: ArtifactType,
        problems: Vec<String>,
    },

    /// Stored hash does not match content
    #[error("corrupted artifact {path}: expected {expected}, found {actual}")]
    Corruption {
        path: PathBuf,
        expected: ContentHash,
        actual: ContentHash,
    },

    /// Another process holds the run lock
    ///
    /// `holder` names the recorded owner; a lock whose owner is gone can be
    /// broken with [`crate::LockMode::BreakStale`].
    #[error("run {run_id} is locked by {holder} ({lock_path})")]
    RunLocked {
        run_id: RunId,
        lock_path: PathBuf,
        holder: String,
    },

    /// Write attempted without holding the run lock
    #[error("run {0} is not locked by this handle")]
    RunNotLocked(RunId),

    /// Write attempted on a finished run
    #[error("run {run_id} is immutable in state {state}")]
    RunImmutable { run_id: RunId, state: RunState },

    /// File name that could escape its directory
    #[error("invalid file name `{0}`")]
    InvalidName(String),

    /// Malformed run identifier
    #[error(transparent)]
    InvalidRunId(#[from] InvalidRunId),

    /// Filesystem failure
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode failure
    #[error("serialization error at {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Short machine-readable kind, used in stop reasons and logs
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyExists { .. } => "already_exists",
            Self::NotFound(_) => "not_found",
            Self::Validation { .. } => "validation",
            Self::Corruption { .. } => "corruption",
            Self::RunLocked { .. } => "run_locked",
            Self::RunNotLocked(_) => "run_not_locked",
            Self::RunImmutable { .. } => "run_immutable",
            Self::InvalidName(_) => "invalid_name",
            Self::InvalidRunId(_) => "invalid_run_id",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
        }
    }

    /// Whether the run can no longer be reasoned about
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::InvalidName(_))
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }
}
