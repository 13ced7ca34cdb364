//! Collaboration event log
//!
//! An append-only JSONL stream under `collaboration/`. Events never carry
//! content inline: question and answer text lives in write-once transcript
//! blobs and events point at them through a [`ContentRef`]. Each event is
//! chained to its predecessor by hash, so any edit, deletion or reordering
//! of earlier lines is detected by [`CollaborationLog::verify_integrity`].

use std::fmt::{self, Display, Formatter};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use specrun_artifact::store::{safe_file_name, write_atomic, COLLABORATION_DIR};
use specrun_artifact::{ContentHash, RunHandle, RunId, RunState};
use tracing::debug;
use ulid::Ulid;

use crate::error::LogError;
use crate::role::Role;

/// Log file name under `collaboration/`
pub const EVENTS_FILE: &str = "collaboration_events.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(alias = "question_asked")]
    StakeholderQuestionAsked,
    #[serde(alias = "answer_received")]
    StakeholderAnswerReceived,
    ArtifactProduced,
    ArtifactRevised,
    AuditGatePassed,
    AuditGateFailed,
    #[serde(alias = "decision_made")]
    OrchestratorDecisionMade,
}

/// Who caused an event; serialized as `orchestrator`, `human` or `role:<Name>`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Actor {
    Orchestrator,
    Role(Role),
    Human,
}

impl Display for Actor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Orchestrator => f.write_str("orchestrator"),
            Self::Human => f.write_str("human"),
            Self::Role(role) => write!(f, "role:{role}"),
        }
    }
}

impl FromStr for Actor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "human" => Ok(Self::Human),
            other => other
                .strip_prefix("role:")
                .ok_or_else(|| format!("unknown actor `{other}`"))?
                .parse::<Role>()
                .map(Self::Role)
                .map_err(|e| e.to_string()),
        }
    }
}

impl TryFrom<String> for Actor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Actor> for String {
    fn from(actor: Actor) -> Self {
        actor.to_string()
    }
}

/// Pointer to separately stored content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRef {
    /// Relative to the run directory
    pub path: String,
    pub content_hash: ContentHash,
}

/// An orchestrator decision with the policy that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: String,
    pub state: RunState,
    pub policy_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rubric_version: Option<String>,
    #[serde(default)]
    pub detail: Value,
}

impl Decision {
    #[must_use]
    pub fn new(kind: impl Into<String>, state: RunState, policy_version: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            state,
            policy_version: policy_version.into(),
            rubric_version: None,
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn with_rubric(mut self, rubric_version: Option<String>) -> Self {
        self.rubric_version = rubric_version;
        self
    }

    #[must_use]
    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

/// One persisted log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollaborationEvent {
    pub event_id: Ulid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    pub actor: Actor,
    pub event_type: EventType,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_ref: Option<ContentRef>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

/// Fields supplied by the emitter; sequence, ids and hashes are assigned on append
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub actor: Actor,
    pub event_type: EventType,
    pub references: Vec<String>,
    pub content_ref: Option<ContentRef>,
    pub summary: String,
    pub decision: Option<Decision>,
}

impl NewEvent {
    #[must_use]
    pub fn new(actor: Actor, event_type: EventType, summary: impl Into<String>) -> Self {
        Self {
            actor,
            event_type,
            references: Vec::new(),
            content_ref: None,
            summary: summary.into(),
            decision: None,
        }
    }

    /// `orchestrator_decision_made` carrying `decision`
    #[must_use]
    pub fn decision(decision: Decision, summary: impl Into<String>) -> Self {
        Self::new(Actor::Orchestrator, EventType::OrchestratorDecisionMade, summary)
            .with_decision(decision)
    }

    #[must_use]
    pub fn with_references(mut self, references: Vec<String>) -> Self {
        self.references = references;
        self
    }

    #[must_use]
    pub fn with_content_ref(mut self, content_ref: ContentRef) -> Self {
        self.content_ref = Some(content_ref);
        self
    }

    #[must_use]
    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct Tail {
    next_sequence: u64,
    last_hash: ContentHash,
}

impl Default for Tail {
    fn default() -> Self {
        Self {
            next_sequence: 0,
            last_hash: ContentHash::new([0; 32]),
        }
    }
}

/// Writer for one run's event log
#[derive(Debug)]
pub struct CollaborationLog {
    path: PathBuf,
    run_id: RunId,
    tail: Mutex<Tail>,
}

impl CollaborationLog {
    /// Open the log of the run `handle` owns, verifying any existing chain
    ///
    /// # Errors
    /// [`LogError::IntegrityViolation`] or [`LogError::Malformed`] if the
    /// existing log does not verify
    pub fn open(handle: &RunHandle) -> Result<Self, LogError> {
        let path = Self::path_in(handle.dir());
        let tail = scan(&path)?.1;
        debug!(run_id = %handle.run_id(), events = tail.next_sequence, "opened collaboration log");
        Ok(Self {
            path,
            run_id: handle.run_id().clone(),
            tail: Mutex::new(tail),
        })
    }

    /// Log path inside a run directory
    #[must_use]
    pub fn path_in(run_dir: &Path) -> PathBuf {
        run_dir.join(COLLABORATION_DIR).join(EVENTS_FILE)
    }

    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append and fsync one event
    ///
    /// # Errors
    /// Lock/immutability violations from the store, or I/O failures
    pub fn append(&self, handle: &RunHandle, new: NewEvent) -> Result<CollaborationEvent, LogError> {
        handle.ensure_writable()?;
        let mut tail = self.tail.lock();
        let mut event = CollaborationEvent {
            event_id: Ulid::new(),
            sequence: tail.next_sequence,
            timestamp: Utc::now(),
            run_id: self.run_id.clone(),
            actor: new.actor,
            event_type: new.event_type,
            references: new.references,
            content_ref: new.content_ref,
            summary: new.summary,
            decision: new.decision,
            prev_hash: tail.last_hash,
            hash: ContentHash::new([0; 32]),
        };
        let mut value = serde_json::to_value(&event).map_err(|source| LogError::Malformed {
            line: usize::try_from(event.sequence).unwrap_or(usize::MAX) + 1,
            source,
        })?;
        event.hash = chain_hash(&mut value);
        let mut line = serde_json::to_string(&event).map_err(|source| LogError::Malformed {
            line: usize::try_from(event.sequence).unwrap_or(usize::MAX) + 1,
            source,
        })?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogError::io(&self.path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| LogError::io(&self.path, e))?;

        *tail = Tail {
            next_sequence: event.sequence + 1,
            last_hash: event.hash,
        };
        debug!(
            run_id = %self.run_id,
            sequence = event.sequence,
            event_type = ?event.event_type,
            "appended collaboration event"
        );
        Ok(event)
    }

    /// All events of the run at `run_dir`, verified
    ///
    /// # Errors
    /// Integrity or parse failures
    pub fn read_all(run_dir: &Path) -> Result<Vec<CollaborationEvent>, LogError> {
        Ok(scan(&Self::path_in(run_dir))?.0)
    }

    /// Verify the chain; returns the number of events
    ///
    /// # Errors
    /// [`LogError::IntegrityViolation`] naming the first bad sequence
    pub fn verify_integrity(run_dir: &Path) -> Result<u64, LogError> {
        Ok(scan(&Self::path_in(run_dir))?.1.next_sequence)
    }
}

/// Hash of an event's JSON form with `hash` removed
fn chain_hash(value: &mut Value) -> ContentHash {
    if let Value::Object(map) = value {
        map.remove("hash");
    }
    ContentHash::of_json(value)
}

fn scan(path: &Path) -> Result<(Vec<CollaborationEvent>, Tail), LogError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), Tail::default())),
        Err(e) => return Err(LogError::io(path, e)),
    };
    let mut tail = Tail::default();
    let mut events = Vec::new();
    for (index, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let mut value: Value =
            serde_json::from_str(line).map_err(|source| LogError::Malformed { line: index + 1, source })?;
        let event: CollaborationEvent = serde_json::from_value(value.clone())
            .map_err(|source| LogError::Malformed { line: index + 1, source })?;
        let violation = |reason: &str| LogError::IntegrityViolation {
            sequence: tail.next_sequence,
            reason: reason.to_string(),
        };
        if event.sequence != tail.next_sequence {
            return Err(violation("sequence gap or reordering"));
        }
        if event.prev_hash != tail.last_hash {
            return Err(violation("prev_hash does not match the preceding event"));
        }
        if chain_hash(&mut value) != event.hash {
            return Err(violation("event hash does not match its fields"));
        }
        tail = Tail {
            next_sequence: tail.next_sequence + 1,
            last_hash: event.hash,
        };
        events.push(event);
    }
    Ok((events, tail))
}

/// Write-once transcript blobs under `collaboration/`
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptStore;

impl TranscriptStore {
    /// Store `text` as `name`, returning its reference
    ///
    /// # Errors
    /// [`LogError::ContentExists`] if `name` was already written
    pub fn write(handle: &RunHandle, name: &str, text: &str) -> Result<ContentRef, LogError> {
        handle.ensure_writable()?;
        let name = safe_file_name(name)?;
        let path = handle.dir().join(COLLABORATION_DIR).join(name);
        if path.exists() || name == EVENTS_FILE {
            return Err(LogError::ContentExists(name.to_string()));
        }
        write_atomic(&path, text.as_bytes())?;
        Ok(ContentRef {
            path: format!("{COLLABORATION_DIR}/{name}"),
            content_hash: ContentHash::compute(text.as_bytes()),
        })
    }

    /// Read referenced content, verifying its hash
    ///
    /// # Errors
    /// [`LogError::ContentMismatch`] if the blob changed since it was written
    pub fn read(run_dir: &Path, content_ref: &ContentRef) -> Result<String, LogError> {
        let path = run_dir.join(&content_ref.path);
        let text = fs::read_to_string(&path).map_err(|e| LogError::io(&path, e))?;
        if ContentHash::compute(text.as_bytes()) != content_ref.content_hash {
            return Err(LogError::ContentMismatch(content_ref.path.clone()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use specrun_artifact::{ArtifactStore, RunMetadata};
    use tempfile::TempDir;

    fn setup() -> (TempDir, RunHandle) {
        let tmp = TempDir::new().unwrap();
        let store = ArtifactStore::new(tmp.path());
        let handle = store
            .initialize_run(RunMetadata::new(RunId::generate(), "test", "v1"))
            .unwrap();
        (tmp, handle)
    }

    fn decision(kind: &str) -> NewEvent {
        NewEvent::decision(Decision::new(kind, RunState::Intake, "v1"), kind)
    }

    #[test]
    fn appends_chain_and_verify() {
        let (_tmp, handle) = setup();
        let log = CollaborationLog::open(&handle).unwrap();
        let first = log.append(&handle, decision("advance")).unwrap();
        let second = log
            .append(
                &handle,
                NewEvent::new(Actor::Role(Role::Architect), EventType::ArtifactProduced, "adr")
                    .with_references(vec!["ArchitectureDecisionRecordSet".into()]),
            )
            .unwrap();
        assert!(first.prev_hash.is_zero());
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(CollaborationLog::verify_integrity(handle.dir()).unwrap(), 2);
    }

    #[test]
    fn reopen_continues_chain() {
        let (_tmp, handle) = setup();
        let first = CollaborationLog::open(&handle)
            .unwrap()
            .append(&handle, decision("a"))
            .unwrap();
        let second = CollaborationLog::open(&handle)
            .unwrap()
            .append(&handle, decision("b"))
            .unwrap();
        assert_eq!(second.sequence, 1);
        assert_eq!(second.prev_hash, first.hash);
    }

    #[test]
    fn tampering_is_detected() {
        let (_tmp, handle) = setup();
        let log = CollaborationLog::open(&handle).unwrap();
        log.append(&handle, decision("advance")).unwrap();
        log.append(&handle, decision("revise")).unwrap();
        let text = fs::read_to_string(log.path()).unwrap();
        fs::write(log.path(), text.replacen("\"advance\"", "\"stop\"", 1)).unwrap();
        let err = CollaborationLog::verify_integrity(handle.dir()).unwrap_err();
        assert!(matches!(err, LogError::IntegrityViolation { sequence: 0, .. }));
    }

    #[test]
    fn deleted_line_is_detected() {
        let (_tmp, handle) = setup();
        let log = CollaborationLog::open(&handle).unwrap();
        for kind in ["a", "b", "c"] {
            log.append(&handle, decision(kind)).unwrap();
        }
        let text = fs::read_to_string(log.path()).unwrap();
        let kept: Vec<&str> = text.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        fs::write(log.path(), kept.join("\n")).unwrap();
        assert!(matches!(
            CollaborationLog::verify_integrity(handle.dir()),
            Err(LogError::IntegrityViolation { sequence: 1, .. })
        ));
    }

    #[test]
    fn actor_wire_format() {
        assert_eq!(serde_json::to_value(Actor::Role(Role::Clarifier)).unwrap(), json!("role:Clarifier"));
        assert_eq!(serde_json::from_value::<Actor>(json!("human")).unwrap(), Actor::Human);
        assert!(serde_json::from_value::<Actor>(json!("role:Wizard")).is_err());
        assert_eq!(
            serde_json::from_value::<EventType>(json!("question_asked")).unwrap(),
            EventType::StakeholderQuestionAsked
        );
    }

    #[test]
    fn transcripts_are_write_once_and_verified() {
        let (_tmp, handle) = setup();
        let content_ref = TranscriptStore::write(&handle, "question-1.txt", "What scale?").unwrap();
        assert_eq!(content_ref.path, "collaboration/question-1.txt");
        assert_eq!(TranscriptStore::read(handle.dir(), &content_ref).unwrap(), "What scale?");
        assert!(matches!(
            TranscriptStore::write(&handle, "question-1.txt", "again"),
            Err(LogError::ContentExists(_))
        ));
        fs::write(handle.dir().join(&content_ref.path), "edited").unwrap();
        assert!(matches!(
            TranscriptStore::read(handle.dir(), &content_ref),
            Err(LogError::ContentMismatch(_))
        ));
    }
}
