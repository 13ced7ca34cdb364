//! Filesystem artifact store
//!
//! Layout under `runs_dir`:
//!
//! ```text
//! <run_id>/
//!   .lock                      exclusive orchestrator lock
//!   metadata.json              RunMetadata + ordered manifest
//!   artifacts/<Type>.json      first canonical revision
//!   artifacts/<Type>.r<N>.json later canonical revisions
//!   artifacts/<Type>.alt-<instance>[.r<N>][.<round>].json  retained alternatives
//!   collaboration/             event log + transcript blobs
//!   audits/                    gate results and reports
//! ```
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! crash never leaves a partially written file visible. All writes require
//! a [`RunHandle`], which owns the run lock for as long as it lives.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artifact::{Artifact, Disposition};
use crate::artifact_type::ArtifactType;
use crate::envelope::check_envelope;
use crate::error::StoreError;
use crate::hash::ContentHash;
use crate::run::{ManifestEntry, RunId, RunMetadata};

pub const METADATA_FILE: &str = "metadata.json";
pub const LOCK_FILE: &str = ".lock";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const COLLABORATION_DIR: &str = "collaboration";
pub const AUDITS_DIR: &str = "audits";
pub const AUDIT_RESULTS_FILE: &str = "audit_results.json";

/// How [`ArtifactStore::open_run`] treats an existing lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Fail with [`StoreError::RunLocked`] if any lock is present
    Exclusive,
    /// Remove a lock left behind by a killed process, then acquire
    BreakStale,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    token: String,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Exclusive ownership of a run directory; released on drop
#[derive(Debug)]
struct RunLock {
    path: PathBuf,
    token: String,
}

impl RunLock {
    fn acquire(run_id: &RunId, dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        let token = format!("{:016x}", rand::rng().random::<u64>());
        let info = LockInfo {
            token: token.clone(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::RunLocked {
                    run_id: run_id.clone(),
                    holder: describe_holder(&path),
                    lock_path: path,
                });
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let body = serde_json::to_vec(&info).map_err(|e| StoreError::json(&path, e))?;
        file.write_all(&body)
            .and_then(|()| file.sync_all())
            .map_err(|e| StoreError::io(&path, e))?;
        Ok(Self { path, token })
    }

    /// Whether the lock file on disk is still ours
    fn is_held(&self) -> bool {
        read_lock_info(&self.path).is_some_and(|info| info.token == self.token)
    }
}

fn read_lock_info(path: &Path) -> Option<LockInfo> {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
}

/// `pid <n> since <time>` from the lock file, for diagnostics
fn describe_holder(path: &Path) -> String {
    read_lock_info(path).map_or_else(
        || "an unknown orchestrator".to_string(),
        |info| format!("pid {} since {}", info.pid, info.acquired_at.to_rfc3339()),
    )
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.is_held() {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to release run lock");
            }
        }
    }
}

/// Proof of exclusive access to one run, plus its cached metadata
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    dir: PathBuf,
    metadata: Mutex<RunMetadata>,
    lock: RunLock,
}

impl RunHandle {
    #[inline]
    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot of the current metadata
    #[must_use]
    pub fn metadata(&self) -> RunMetadata {
        self.metadata.lock().clone()
    }

    /// Fails unless the lock is still ours and the run has not finished
    ///
    /// # Errors
    /// [`StoreError::RunNotLocked`] or [`StoreError::RunImmutable`]
    pub fn ensure_writable(&self) -> Result<(), StoreError> {
        if !self.lock.is_held() {
            return Err(StoreError::RunNotLocked(self.run_id.clone()));
        }
        let state = self.metadata.lock().state;
        if state.is_terminal() {
            return Err(StoreError::RunImmutable {
                run_id: self.run_id.clone(),
                state,
            });
        }
        Ok(())
    }
}

/// Summary of a full-run hash verification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    pub checked: usize,
    pub failures: Vec<VerifyFailure>,
}

impl VerifyReport {
    #[inline]
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyFailure {
    pub file_ref: String,
    pub reason: String,
}

/// Durable, content-addressed artifact persistence
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    runs_dir: PathBuf,
}

impl ArtifactStore {
    #[must_use]
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    #[inline]
    #[must_use]
    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    #[must_use]
    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(run_id.as_str())
    }

    #[must_use]
    pub fn exists(&self, run_id: &RunId) -> bool {
        self.run_dir(run_id).is_dir()
    }

    /// Create the run directory tree, take the lock and persist `metadata`
    ///
    /// # Errors
    /// [`StoreError::AlreadyExists`] if the run directory is already present
    pub fn initialize_run(&self, metadata: RunMetadata) -> Result<RunHandle, StoreError> {
        let run_id = metadata.run_id.clone();
        let dir = self.run_dir(&run_id);
        fs::create_dir_all(&self.runs_dir).map_err(|e| StoreError::io(&self.runs_dir, e))?;
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists { run_id });
            }
            Err(e) => return Err(StoreError::io(&dir, e)),
        }
        let lock = RunLock::acquire(&run_id, &dir)?;
        for sub in [ARTIFACTS_DIR, COLLABORATION_DIR, AUDITS_DIR] {
            let path = dir.join(sub);
            fs::create_dir_all(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        write_json_atomic(&dir.join(METADATA_FILE), &metadata)?;
        info!(run_id = %run_id, dir = %dir.display(), "initialized run");
        Ok(RunHandle {
            run_id,
            dir,
            metadata: Mutex::new(metadata),
            lock,
        })
    }

    /// Re-acquire an existing run for resumption
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown runs, [`StoreError::RunLocked`] when
    /// another orchestrator holds the lock under [`LockMode::Exclusive`]
    pub fn open_run(&self, run_id: &RunId, mode: LockMode) -> Result<RunHandle, StoreError> {
        let dir = self.run_dir(run_id);
        if !dir.is_dir() {
            return Err(StoreError::NotFound(format!("run {run_id}")));
        }
        if mode == LockMode::BreakStale {
            let lock_path = dir.join(LOCK_FILE);
            let holder = describe_holder(&lock_path);
            match fs::remove_file(&lock_path) {
                Ok(()) => warn!(run_id = %run_id, %holder, "removed stale run lock"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(&lock_path, e)),
            }
        }
        let lock = RunLock::acquire(run_id, &dir)?;
        let metadata = self.read_metadata(run_id)?;
        info!(run_id = %run_id, state = %metadata.state, "opened run");
        Ok(RunHandle {
            run_id: run_id.clone(),
            dir,
            metadata: Mutex::new(metadata),
            lock,
        })
    }

    /// Load `metadata.json`
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if the run does not exist
    pub fn read_metadata(&self, run_id: &RunId) -> Result<RunMetadata, StoreError> {
        let path = self.run_dir(run_id).join(METADATA_FILE);
        read_json(&path).map_err(|e| match e {
            StoreError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                StoreError::NotFound(format!("run {run_id}"))
            }
            other => other,
        })
    }

    /// Mutate and persist the run metadata
    ///
    /// The closure may move the run into a terminal state; once there, no
    /// further write is accepted.
    ///
    /// # Errors
    /// Lock/immutability violations or I/O failures
    pub fn update_metadata<F>(&self, handle: &RunHandle, f: F) -> Result<RunMetadata, StoreError>
    where
        F: FnOnce(&mut RunMetadata),
    {
        handle.ensure_writable()?;
        let mut guard = handle.metadata.lock();
        let mut updated = guard.clone();
        f(&mut updated);
        updated.run_id = handle.run_id.clone();
        updated.updated_at = Utc::now();
        write_json_atomic(&handle.dir.join(METADATA_FILE), &updated)?;
        *guard = updated.clone();
        Ok(updated)
    }

    /// Validate, hash and persist `artifact`, appending it to the manifest
    ///
    /// # Errors
    /// [`StoreError::Validation`] for envelope, content or revision problems;
    /// lock/immutability violations; I/O failures
    pub fn write_artifact(
        &self,
        handle: &RunHandle,
        artifact: &Artifact,
    ) -> Result<ContentHash, StoreError> {
        handle.ensure_writable()?;
        let artifact_type = artifact.artifact_type();
        let invalid = |problems: Vec<String>| StoreError::Validation {
            artifact_type,
            problems,
        };

        let mut problems = check_envelope(artifact);
        if artifact.provenance.run_id != handle.run_id {
            problems.push(format!(
                "provenance.run_id {} does not match run {}",
                artifact.provenance.run_id, handle.run_id
            ));
        }
        if !problems.is_empty() {
            return Err(invalid(problems));
        }
        let content_hash = artifact.recompute_hash();

        let mut guard = handle.metadata.lock();
        let file_name = match artifact.disposition {
            Disposition::Canonical => {
                check_revision(&guard, artifact).map_err(|p| invalid(vec![p]))?;
                canonical_file_name(artifact_type, artifact.revision())
            }
            Disposition::Alternative => alternative_file_name(
                artifact_type,
                &artifact.provenance.created_by_instance_id,
                artifact.revision(),
            ),
        };
        let recorded = |file_ref: &str| guard.artifacts_manifest.iter().any(|e| e.file_ref == file_ref);
        let mut file_ref = format!("{ARTIFACTS_DIR}/{file_name}");
        if artifact.disposition == Disposition::Alternative {
            // a repeated synthesis round keeps the earlier round's alternatives
            let mut round = 2;
            while recorded(&file_ref) {
                file_ref = format!("{ARTIFACTS_DIR}/{}", numbered_round(&file_name, round));
                round += 1;
            }
        }
        if recorded(&file_ref) {
            return Err(invalid(vec![format!("{file_ref} already written")]));
        }
        let path = handle.dir.join(&file_ref);
        if path.exists() {
            // renamed into place before a crash, never reached the manifest
            warn!(run_id = %handle.run_id, file_ref = %file_ref, "replacing orphaned artifact file");
        }

        write_json_atomic(&path, artifact)?;

        let mut updated = guard.clone();
        updated.artifacts_manifest.push(ManifestEntry {
            artifact_type,
            artifact_id: artifact.artifact_id().to_string(),
            revision: artifact.revision(),
            disposition: artifact.disposition,
            file_ref: file_ref.clone(),
            content_hash,
        });
        updated.updated_at = Utc::now();
        write_json_atomic(&handle.dir.join(METADATA_FILE), &updated)?;
        *guard = updated;

        debug!(
            run_id = %handle.run_id,
            artifact_type = %artifact_type,
            revision = artifact.revision(),
            file_ref = %file_ref,
            hash = %content_hash.short(),
            "wrote artifact"
        );
        Ok(content_hash)
    }

    /// Latest canonical revision of `artifact_type`
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if absent, [`StoreError::Corruption`] on hash mismatch
    pub fn read_artifact(
        &self,
        run_id: &RunId,
        artifact_type: ArtifactType,
    ) -> Result<Artifact, StoreError> {
        let metadata = self.read_metadata(run_id)?;
        let entry = metadata
            .latest_canonical(artifact_type)
            .ok_or_else(|| StoreError::NotFound(format!("{artifact_type} in run {run_id}")))?;
        self.read_artifact_by_ref(run_id, entry)
    }

    /// Read and verify the artifact a manifest entry points at
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if the file is missing, [`StoreError::Corruption`]
    /// if its content no longer matches either the stored or the manifest hash
    pub fn read_artifact_by_ref(
        &self,
        run_id: &RunId,
        entry: &ManifestEntry,
    ) -> Result<Artifact, StoreError> {
        let path = self.run_dir(run_id).join(&entry.file_ref);
        let artifact: Artifact = read_json(&path).map_err(|e| match e {
            StoreError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                StoreError::NotFound(format!("{} in run {run_id}", entry.file_ref))
            }
            other => other,
        })?;
        let actual = artifact.recompute_hash();
        for expected in [artifact.content_hash, entry.content_hash] {
            if expected != actual {
                return Err(StoreError::Corruption {
                    path,
                    expected,
                    actual,
                });
            }
        }
        Ok(artifact)
    }

    /// Manifest in write order
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if the run does not exist
    pub fn list_artifacts(&self, run_id: &RunId) -> Result<Vec<ManifestEntry>, StoreError> {
        Ok(self.read_metadata(run_id)?.artifacts_manifest)
    }

    /// Latest canonical artifact per type, in order of first write
    ///
    /// # Errors
    /// Any read or verification failure
    pub fn canonical_artifacts(&self, run_id: &RunId) -> Result<Vec<Artifact>, StoreError> {
        let metadata = self.read_metadata(run_id)?;
        metadata
            .canonical_entries()
            .into_iter()
            .map(|entry| self.read_artifact_by_ref(run_id, entry))
            .collect()
    }

    /// Re-hash every artifact in the manifest
    ///
    /// # Errors
    /// Only when the metadata itself cannot be read
    pub fn verify_run(&self, run_id: &RunId) -> Result<VerifyReport, StoreError> {
        let metadata = self.read_metadata(run_id)?;
        let mut report = VerifyReport::default();
        for entry in &metadata.artifacts_manifest {
            report.checked += 1;
            if let Err(e) = self.read_artifact_by_ref(run_id, entry) {
                report.failures.push(VerifyFailure {
                    file_ref: entry.file_ref.clone(),
                    reason: e.to_string(),
                });
            }
        }
        Ok(report)
    }

    /// Persist gate results as `audits/audit_results.json`
    ///
    /// # Errors
    /// Lock/immutability violations or I/O failures
    pub fn write_audit_results<T: Serialize>(
        &self,
        handle: &RunHandle,
        results: &T,
    ) -> Result<(), StoreError> {
        self.write_report(handle, AUDIT_RESULTS_FILE, results)
    }

    /// Persist a derived report under `audits/`
    ///
    /// # Errors
    /// Lock/immutability violations, an unsafe `name`, or I/O failures
    pub fn write_report<T: Serialize>(
        &self,
        handle: &RunHandle,
        name: &str,
        report: &T,
    ) -> Result<(), StoreError> {
        handle.ensure_writable()?;
        let path = handle.dir.join(AUDITS_DIR).join(safe_file_name(name)?);
        write_json_atomic(&path, report)
    }

    /// Read a report previously written under `audits/`
    ///
    /// # Errors
    /// [`StoreError::NotFound`] if it was never written
    pub fn read_report<T: for<'de> Deserialize<'de>>(
        &self,
        run_id: &RunId,
        name: &str,
    ) -> Result<T, StoreError> {
        let path = self
            .run_dir(run_id)
            .join(AUDITS_DIR)
            .join(safe_file_name(name)?);
        read_json(&path).map_err(|e| match e {
            StoreError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound => {
                StoreError::NotFound(format!("{name} in run {run_id}"))
            }
            other => other,
        })
    }
}

fn check_revision(metadata: &RunMetadata, artifact: &Artifact) -> Result<(), String> {
    match metadata.latest_canonical(artifact.artifact_type()) {
        None if artifact.revision() == 1 || artifact.provenance.base_run_id.is_some() => Ok(()),
        None => Err(format!(
            "first {} must be revision 1, got {}",
            artifact.artifact_type(),
            artifact.revision()
        )),
        Some(prev) if prev.artifact_id != artifact.artifact_id() => Err(format!(
            "{} already exists as `{}`; a revision must keep that artifact_id (got `{}`)",
            artifact.artifact_type(),
            prev.artifact_id,
            artifact.artifact_id()
        )),
        Some(prev) if artifact.revision() != prev.revision + 1 => Err(format!(
            "{} revision must be {}, got {}",
            artifact.artifact_type(),
            prev.revision + 1,
            artifact.revision()
        )),
        Some(_) => Ok(()),
    }
}

fn canonical_file_name(artifact_type: ArtifactType, revision: u32) -> String {
    if revision <= 1 {
        format!("{artifact_type}.json")
    } else {
        format!("{artifact_type}.r{revision}.json")
    }
}

fn alternative_file_name(artifact_type: ArtifactType, instance: &str, revision: u32) -> String {
    let instance = sanitize(instance);
    if revision <= 1 {
        format!("{artifact_type}.alt-{instance}.json")
    } else {
        format!("{artifact_type}.alt-{instance}.r{revision}.json")
    }
}

fn numbered_round(file_name: &str, round: u32) -> String {
    let stem = file_name.strip_suffix(".json").unwrap_or(file_name);
    format!("{stem}.{round}.json")
}

/// Map arbitrary text onto `[A-Za-z0-9_-]`
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Reject names that could escape their directory
pub fn safe_file_name(name: &str) -> Result<&str, StoreError> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(name)
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Write `bytes` to a temporary sibling, fsync, then rename over `path`
///
/// # Errors
/// Any I/O failure; the temporary file is removed on error
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| StoreError::NotFound(format!("parent of {}", path.display())))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(
        ".{file_name}.tmp-{:08x}",
        rand::rng().random::<u32>()
    ));
    let result = (|| {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Pretty JSON via [`write_atomic`]
///
/// # Errors
/// Serialization or I/O failures
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(|e| StoreError::json(path, e))?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::json(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::RunState;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArtifactStore, RunHandle) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path().join("runs"));
        let handle = store
            .initialize_run(RunMetadata::new(RunId::generate(), "test", "v1"))
            .unwrap();
        (tmp, store, handle)
    }

    fn brief(handle: &RunHandle, revision: u32, title: &str) -> Artifact {
        Artifact::builder(ArtifactType::ProblemBrief, handle.run_id().clone())
            .created_by("IntakeAnalyst", "IntakeAnalyst#0")
            .revision(revision)
            .build(json!({"title": title, "goals": [{"id": "OBJ-0001"}]}))
    }

    #[test]
    fn initialize_creates_layout() {
        let (_tmp, store, handle) = setup();
        let dir = store.run_dir(handle.run_id());
        for sub in [ARTIFACTS_DIR, COLLABORATION_DIR, AUDITS_DIR] {
            assert!(dir.join(sub).is_dir());
        }
        assert!(dir.join(METADATA_FILE).is_file());
        assert!(dir.join(LOCK_FILE).is_file());
    }

    #[test]
    fn initialize_twice_fails() {
        let (_tmp, store, handle) = setup();
        let again = store.initialize_run(RunMetadata::new(handle.run_id().clone(), "test", "v1"));
        assert!(matches!(again, Err(StoreError::AlreadyExists { .. })));
    }

    #[test]
    fn write_then_read_verifies() {
        let (_tmp, store, handle) = setup();
        let artifact = brief(&handle, 1, "Tracker");
        let hash = store.write_artifact(&handle, &artifact).unwrap();
        assert_eq!(hash, artifact.content_hash);
        let read = store
            .read_artifact(handle.run_id(), ArtifactType::ProblemBrief)
            .unwrap();
        assert_eq!(read, artifact);
        assert!(store.run_dir(handle.run_id()).join("artifacts/ProblemBrief.json").is_file());
    }

    #[test]
    fn missing_artifact_not_found() {
        let (_tmp, store, handle) = setup();
        let err = store
            .read_artifact(handle.run_id(), ArtifactType::TestPlan)
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn revision_rules_enforced() {
        let (_tmp, store, handle) = setup();
        store.write_artifact(&handle, &brief(&handle, 1, "a")).unwrap();

        let dup = store.write_artifact(&handle, &brief(&handle, 1, "b"));
        assert!(matches!(dup, Err(StoreError::Validation { .. })));

        let skip = store.write_artifact(&handle, &brief(&handle, 3, "c"));
        assert!(matches!(skip, Err(StoreError::Validation { .. })));

        store.write_artifact(&handle, &brief(&handle, 2, "d")).unwrap();
        let latest = store
            .read_artifact(handle.run_id(), ArtifactType::ProblemBrief)
            .unwrap();
        assert_eq!(latest.revision(), 2);
        assert_eq!(latest.content["title"], "d");
        assert_eq!(store.list_artifacts(handle.run_id()).unwrap().len(), 2);
    }

    #[test]
    fn alternatives_stored_separately() {
        let (_tmp, store, handle) = setup();
        let alt = Artifact::builder(ArtifactType::ProblemBrief, handle.run_id().clone())
            .artifact_id("ProblemBrief~1")
            .created_by("IntakeAnalyst", "IntakeAnalyst#1")
            .disposition(Disposition::Alternative)
            .build(json!({"goals": []}));
        store.write_artifact(&handle, &alt).unwrap();
        store.write_artifact(&handle, &brief(&handle, 1, "chosen")).unwrap();

        let manifest = store.list_artifacts(handle.run_id()).unwrap();
        assert_eq!(manifest[0].file_ref, "artifacts/ProblemBrief.alt-IntakeAnalyst_1.json");
        assert_eq!(manifest[1].file_ref, "artifacts/ProblemBrief.json");
        let canonical = store.canonical_artifacts(handle.run_id()).unwrap();
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].content["title"], "chosen");
    }

    #[test]
    fn unrecorded_file_is_replaced() {
        let (_tmp, store, handle) = setup();
        let path = store.run_dir(handle.run_id()).join("artifacts/ProblemBrief.json");
        fs::write(&path, b"{\"half\": true}").unwrap();

        store.write_artifact(&handle, &brief(&handle, 1, "Tracker")).unwrap();

        let read = store
            .read_artifact(handle.run_id(), ArtifactType::ProblemBrief)
            .unwrap();
        assert_eq!(read.content["title"], "Tracker");
    }

    #[test]
    fn recorded_file_is_never_replaced() {
        let (_tmp, store, handle) = setup();
        let first = brief(&handle, 1, "Tracker");
        store.write_artifact(&handle, &first).unwrap();
        let err = store.write_artifact(&handle, &first).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn repeated_alternative_gets_next_round() {
        let (_tmp, store, handle) = setup();
        let alt = Artifact::builder(ArtifactType::ProblemBrief, handle.run_id().clone())
            .artifact_id("ProblemBrief~1")
            .created_by("IntakeAnalyst", "IntakeAnalyst#1")
            .disposition(Disposition::Alternative)
            .build(json!({"goals": []}));
        store.write_artifact(&handle, &alt).unwrap();
        store.write_artifact(&handle, &alt).unwrap();

        let refs: Vec<String> = store
            .list_artifacts(handle.run_id())
            .unwrap()
            .into_iter()
            .map(|e| e.file_ref)
            .collect();
        assert_eq!(
            refs,
            vec![
                "artifacts/ProblemBrief.alt-IntakeAnalyst_1.json".to_string(),
                "artifacts/ProblemBrief.alt-IntakeAnalyst_1.2.json".to_string(),
            ]
        );
    }

    #[test]
    fn tampered_file_is_corruption() {
        let (_tmp, store, handle) = setup();
        store.write_artifact(&handle, &brief(&handle, 1, "Tracker")).unwrap();
        let path = store.run_dir(handle.run_id()).join("artifacts/ProblemBrief.json");
        let mut raw: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        raw["content"]["title"] = json!("Tampered");
        fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

        let err = store
            .read_artifact(handle.run_id(), ArtifactType::ProblemBrief)
            .unwrap_err();
        assert!(matches!(err, StoreError::Corruption { .. }));
        let report = store.verify_run(handle.run_id()).unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.failures.len(), 1);
    }

    #[test]
    fn invalid_envelope_rejected_before_disk() {
        let (_tmp, store, handle) = setup();
        let mut artifact = brief(&handle, 1, "Tracker");
        artifact.content_hash = ContentHash::default();
        let err = store.write_artifact(&handle, &artifact).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
        assert!(store.list_artifacts(handle.run_id()).unwrap().is_empty());
    }

    #[test]
    fn second_orchestrator_is_locked_out() {
        let (_tmp, store, handle) = setup();
        let err = store.open_run(handle.run_id(), LockMode::Exclusive).unwrap_err();
        match err {
            StoreError::RunLocked { holder, .. } => {
                assert!(holder.starts_with(&format!("pid {} since ", std::process::id())), "{holder}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn dropping_handle_releases_lock() {
        let (_tmp, store, handle) = setup();
        let run_id = handle.run_id().clone();
        drop(handle);
        let reopened = store.open_run(&run_id, LockMode::Exclusive).unwrap();
        assert_eq!(reopened.metadata().state, RunState::Intake);
    }

    #[test]
    fn broken_lock_revokes_old_handle() {
        let (_tmp, store, old) = setup();
        let new = store.open_run(old.run_id(), LockMode::BreakStale).unwrap();
        let err = store.write_artifact(&old, &brief(&old, 1, "late")).unwrap_err();
        assert!(matches!(err, StoreError::RunNotLocked(_)));
        store.write_artifact(&new, &brief(&new, 1, "fresh")).unwrap();
    }

    #[test]
    fn terminal_run_is_immutable() {
        let (_tmp, store, handle) = setup();
        store
            .update_metadata(&handle, |m| {
                m.state = RunState::Final;
                m.execution_successful = Some(true);
            })
            .unwrap();
        let err = store.write_artifact(&handle, &brief(&handle, 1, "late")).unwrap_err();
        assert!(matches!(err, StoreError::RunImmutable { .. }));
        let err = store.update_metadata(&handle, |m| m.state = RunState::Intake).unwrap_err();
        assert!(matches!(err, StoreError::RunImmutable { .. }));
    }

    #[test]
    fn foreign_run_id_rejected() {
        let (_tmp, store, handle) = setup();
        let foreign = Artifact::builder(ArtifactType::ProblemBrief, RunId::generate())
            .build(json!({"goals": []}));
        let err = store.write_artifact(&handle, &foreign).unwrap_err();
        assert!(matches!(err, StoreError::Validation { .. }));
    }

    #[test]
    fn report_names_cannot_escape() {
        let (_tmp, store, handle) = setup();
        assert!(store.write_report(&handle, "../evil.json", &json!({})).is_err());
        store.write_report(&handle, "traceability_matrix.json", &json!({"rows": []})).unwrap();
        let back: serde_json::Value = store
            .read_report(handle.run_id(), "traceability_matrix.json")
            .unwrap();
        assert_eq!(back, json!({"rows": []}));
    }
}
