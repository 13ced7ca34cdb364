//! Testing utilities for the specrun workspace
//!
//! Scripted executors, invocation counters and run fixtures.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use specrun_artifact::{ArtifactStore, ModelRef, PipelineInput};
use specrun_core::{
    DryRunExecutor, ExecutorError, ExecutorRegistry, Orchestrator, PipelineConfig, RetryPolicy,
    Role, RoleExecutor, RoleOutput, RoleRequest,
};
use tempfile::TempDir;

/// Input comfortably above the default sufficiency threshold
pub const TASK_TRACKER_INPUT: &str = "Build a task tracker with due dates and reminders";

/// Scripted failures for one role
#[derive(Debug, Clone)]
pub enum Script {
    /// Throttle `times` calls, then succeed
    Throttle { times: u32, hints: Vec<(String, String)> },
    /// Fail every call without retry
    Fatal(String),
    /// Return this content instead of the dry-run document
    Content(Value),
}

/// Dry-run executor with per-role scripts
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<Role, Script>>,
    calls: Mutex<HashMap<Role, u32>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn throttle(self, role: Role, times: u32) -> Self {
        self.script(role, Script::Throttle { times, hints: Vec::new() })
    }

    pub fn throttle_with_hint(self, role: Role, times: u32, hint: &str, value: &str) -> Self {
        self.script(
            role,
            Script::Throttle {
                times,
                hints: vec![(hint.to_string(), value.to_string())],
            },
        )
    }

    pub fn fatal(self, role: Role, message: &str) -> Self {
        self.script(role, Script::Fatal(message.to_string()))
    }

    pub fn content(self, role: Role, content: Value) -> Self {
        self.script(role, Script::Content(content))
    }

    fn script(self, role: Role, script: Script) -> Self {
        self.scripts.lock().insert(role, script);
        self
    }

    pub fn calls(&self, role: Role) -> u32 {
        self.calls.lock().get(&role).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RoleExecutor for ScriptedExecutor {
    async fn invoke(&self, request: &RoleRequest) -> Result<RoleOutput, ExecutorError> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(request.role).or_insert(0);
            *count += 1;
            *count
        };
        let script = self.scripts.lock().get(&request.role).cloned();
        match script {
            Some(Script::Throttle { times, hints }) if call <= times => {
                let mut error = ExecutorError::retryable(format!("throttled call {call}"));
                if let ExecutorError::Retryable { hints: slot, .. } = &mut error {
                    slot.extend(hints);
                }
                Err(error)
            }
            Some(Script::Fatal(message)) => Err(ExecutorError::Fatal(message)),
            Some(Script::Content(content)) => Ok(RoleOutput::new(content, ModelRef::new("scripted", "v1"))),
            _ => DryRunExecutor.invoke(request).await,
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Counts invocations per role before delegating
pub struct CountingExecutor {
    inner: Arc<dyn RoleExecutor>,
    calls: Mutex<HashMap<Role, u32>>,
}

impl CountingExecutor {
    pub fn new(inner: Arc<dyn RoleExecutor>) -> Self {
        Self {
            inner,
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn dry_run() -> Self {
        Self::new(Arc::new(DryRunExecutor))
    }

    pub fn calls(&self, role: Role) -> u32 {
        self.calls.lock().get(&role).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl RoleExecutor for CountingExecutor {
    async fn invoke(&self, request: &RoleRequest) -> Result<RoleOutput, ExecutorError> {
        *self.calls.lock().entry(request.role).or_insert(0) += 1;
        self.inner.invoke(request).await
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Never answers for `role`; dry-run for everything else
#[derive(Debug, Clone, Copy)]
pub struct PendingExecutor {
    pub role: Role,
}

#[async_trait]
impl RoleExecutor for PendingExecutor {
    async fn invoke(&self, request: &RoleRequest) -> Result<RoleOutput, ExecutorError> {
        if request.role == self.role {
            std::future::pending::<()>().await;
        }
        DryRunExecutor.invoke(request).await
    }
}

/// Config writing into `dir`, with immediate retries
pub fn test_config(dir: &TempDir) -> PipelineConfig {
    PipelineConfig::default()
        .with_runs_directory(dir.path().join("runs"))
        .with_retry(RetryPolicy::immediate())
}

pub fn orchestrator(dir: &TempDir, executors: ExecutorRegistry) -> Orchestrator {
    Orchestrator::new(test_config(dir), executors)
}

pub fn dry_run_orchestrator(dir: &TempDir) -> Orchestrator {
    orchestrator(dir, ExecutorRegistry::dry_run())
}

pub fn registry_with(executor: Arc<dyn RoleExecutor>) -> ExecutorRegistry {
    ExecutorRegistry::new().with_default(executor)
}

pub fn task_tracker_input() -> PipelineInput {
    PipelineInput::new(TASK_TRACKER_INPUT).with_source("tests")
}

pub fn store(dir: &TempDir) -> ArtifactStore {
    ArtifactStore::new(dir.path().join("runs"))
}

pub fn temp_dir() -> TempDir {
    TempDir::new().expect("create temp dir")
}
