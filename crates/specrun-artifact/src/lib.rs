//! specrun Artifact System
//!
//! Typed, content-addressed specification artifacts and their durable
//! run storage.
//!
//! # Core Concepts
//!
//! - [`Artifact`]: envelope of identity, provenance, typed content and hash
//! - [`ArtifactType`]: closed catalog of document kinds with content models
//! - [`ContentHash`]: SHA-256 over canonical JSON of the content
//! - [`StableIds`]: `PREFIX-NNNN` definitions and references inside content
//! - [`ArtifactStore`]: run directories, exclusive locks, atomic writes
//!
//! # Example
//!
//! ```rust,ignore
//! use specrun_artifact::{Artifact, ArtifactStore, ArtifactType, RunId, RunMetadata};
//!
//! let store = ArtifactStore::new("runs");
//! let handle = store.initialize_run(RunMetadata::new(RunId::generate(), "default", "v1"))?;
//! let brief = Artifact::builder(ArtifactType::ProblemBrief, handle.run_id().clone())
//!     .created_by("IntakeAnalyst", "IntakeAnalyst#0")
//!     .build(serde_json::json!({"goals": [{"id": "OBJ-0001"}]}));
//! let hash = store.write_artifact(&handle, &brief)?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod artifact;
mod artifact_type;
mod error;
mod hash;
mod run;

pub mod canonical;
pub mod envelope;
pub mod stable_id;
pub mod store;
pub mod types;

pub use artifact::{
    Artifact, ArtifactBuilder, ArtifactIdentity, Disposition, InputRef, ModelRef, Provenance,
    QualityMetadata, SCHEMA_VERSION,
};
pub use artifact_type::{ArtifactType, UnknownArtifactType};
pub use envelope::check_envelope;
pub use error::StoreError;
pub use hash::{ContentHash, HashError, HASH_PREFIX};
pub use run::{
    Clarification, InvalidRunId, ManifestEntry, PipelineInput, RunId, RunMetadata, RunState,
};
pub use stable_id::StableIds;
pub use store::{ArtifactStore, LockMode, RunHandle, VerifyFailure, VerifyReport};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
