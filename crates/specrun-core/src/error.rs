//! Error types for specrun Core
//!
//! One enum per concern:
//! - role executor failures (retryable vs fatal)
//! - rate-limit adapter outcomes
//! - collaboration log integrity
//! - configuration loading
//! - illegal state transitions
//! - orchestrator and derived-run aborts

use std::collections::BTreeMap;
use std::path::PathBuf;

use specrun_artifact::{RunId, RunState, StoreError};

use crate::role::Role;

/// Failure reported by a role executor
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    /// Throttled or transiently unavailable; `hints` carries header-like
    /// reset signals such as `retry-after`
    #[error("retryable executor error: {message}")]
    Retryable {
        message: String,
        hints: BTreeMap<String, String>,
    },

    /// Will not succeed on retry
    #[error("fatal executor error: {0}")]
    Fatal(String),

    /// Returned content that does not fit the role's output type
    #[error("{role} returned invalid content: {}", problems.join("; "))]
    InvalidOutput { role: Role, problems: Vec<String> },
}

impl ExecutorError {
    /// Retryable error without reset hints
    #[must_use]
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            hints: BTreeMap::new(),
        }
    }

    /// Retryable error carrying one reset hint
    #[must_use]
    pub fn throttled(message: impl Into<String>, hint: impl Into<String>, value: impl Into<String>) -> Self {
        let mut hints = BTreeMap::new();
        hints.insert(hint.into(), value.into());
        Self::Retryable {
            message: message.into(),
            hints,
        }
    }

    /// Whether the rate-limit adapter may retry this error
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Reset hints, empty for non-retryable errors
    #[must_use]
    pub fn hints(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Self::Retryable { hints, .. } => Some(hints),
            _ => None,
        }
    }
}

/// Outcome of [`invoke_with_retry`](crate::rate_limit::invoke_with_retry) when no response was obtained
#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    /// Every attempt was throttled
    #[error("rate limit retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: ExecutorError,
    },

    /// A non-retryable error, surfaced on first occurrence
    #[error(transparent)]
    Fatal(ExecutorError),

    /// Run-level cancellation fired while waiting
    #[error("invocation cancelled")]
    Cancelled,
}

impl RateLimitError {
    /// Whether the failure may be charged to the state's retry budget
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Exhausted { .. } => true,
            Self::Fatal(e) => matches!(e, ExecutorError::InvalidOutput { .. }),
            Self::Cancelled => false,
        }
    }
}

/// Collaboration log failures
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Chain broken: a line was altered, removed or reordered
    #[error("collaboration log integrity violation at sequence {sequence}: {reason}")]
    IntegrityViolation { sequence: u64, reason: String },

    /// Unparseable log line
    #[error("malformed collaboration event on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// Content blob already written under this name
    #[error("collaboration content `{0}` already exists")]
    ContentExists(String),

    /// Stored content no longer matches its reference hash
    #[error("collaboration content `{0}` does not match its hash")]
    ContentMismatch(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LogError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Pipeline configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is present but unusable; `key` names it
    #[error("invalid config `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// State transition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: RunState, to: RunState },
}

/// Errors that abort a run or prevent it from starting
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transition(#[from] StateMachineError),

    /// The pipeline names a role nobody can execute
    #[error("no executor registered for role {0}")]
    NoExecutor(Role),

    /// Resume requested for a run that already finished
    #[error("run {run_id} already finished in state {state}")]
    RunFinished { run_id: RunId, state: RunState },

    /// Run metadata lacks something the state machine needs
    #[error("run {run_id} cannot continue: {reason}")]
    Inconsistent { run_id: RunId, reason: String },
}

impl OrchestratorError {
    /// Short machine-readable kind, used in CLI output
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Store(e) => e.kind(),
            Self::Log(LogError::IntegrityViolation { .. }) => "log_integrity",
            Self::Log(_) => "log",
            Self::Config(_) => "config",
            Self::Transition(_) => "illegal_transition",
            Self::NoExecutor(_) => "no_executor",
            Self::RunFinished { .. } => "run_finished",
            Self::Inconsistent { .. } => "inconsistent_run",
        }
    }
}

/// Derived-run request failures
#[derive(Debug, thiserror::Error)]
pub enum DerivedRunError {
    /// Base run lacks the stored state a derived run needs
    #[error("run {run_id} cannot be used as a base run: {reason}")]
    UnsupportedBaseRun { run_id: RunId, reason: String },

    /// Amendment names a different base run than requested
    #[error("amendment targets run {found}, not {expected}")]
    BaseRunMismatch { expected: RunId, found: RunId },

    #[error("cannot read amendment {path}: {source}")]
    AmendmentIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed amendment: {0}")]
    AmendmentFormat(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

impl DerivedRunError {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedBaseRun { .. } => "unsupported_base_run",
            Self::BaseRunMismatch { .. } => "base_run_mismatch",
            Self::AmendmentIo { .. } | Self::AmendmentFormat(_) => "amendment",
            Self::Store(e) => e.kind(),
            Self::Orchestrator(e) => e.kind(),
        }
    }
}

impl From<LogError> for DerivedRunError {
    fn from(e: LogError) -> Self {
        Self::Orchestrator(OrchestratorError::Log(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ExecutorError::retryable("429").is_retryable());
        assert!(!ExecutorError::Fatal("bad key".into()).is_retryable());
        let e = ExecutorError::throttled("429", "retry-after", "3");
        assert_eq!(e.hints().and_then(|h| h.get("retry-after")).map(String::as_str), Some("3"));
    }

    #[test]
    fn exhausted_is_recoverable_cancel_is_not() {
        let exhausted = RateLimitError::Exhausted {
            attempts: 3,
            last: ExecutorError::retryable("429"),
        };
        assert!(exhausted.is_recoverable());
        assert!(!RateLimitError::Cancelled.is_recoverable());
        assert!(!RateLimitError::Fatal(ExecutorError::Fatal("x".into())).is_recoverable());
    }

    #[test]
    fn kinds_are_stable() {
        let e = OrchestratorError::NoExecutor(Role::Architect);
        assert_eq!(e.kind(), "no_executor");
        assert_eq!(e.to_string(), "no executor registered for role Architect");
    }
}
