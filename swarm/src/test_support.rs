//! Test-only helpers: deterministic tasks, snapshots, workspaces and a
//! scripted language model.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tempfile::TempDir;

use crate::core::identity::decode;
use crate::core::report::{WorkerSnapshot, WorkerStatus};
use crate::core::task::{NewTask, Task, TaskPolicy};
use crate::error::DispatchError;
use crate::io::init::{InitOptions, SwarmPaths, init_workspace};
use crate::io::provider::{Dispatch, DispatchOptions, LanguageModel};

/// `pending → completed` policy retryable from `pending`.
pub fn policy(max_retries: u32) -> TaskPolicy {
    TaskPolicy {
        initial_status: "pending".to_string(),
        success_status: "completed".to_string(),
        retryable_statuses: vec!["pending".to_string()],
        max_retries,
        requires_manager: false,
    }
}

/// A pending `generic` task with deterministic fields.
pub fn task(id: u64) -> Task {
    let now = Utc::now();
    Task {
        id,
        task_type: "generic".to_string(),
        title: format!("task {id}"),
        description: format!("task {id} description"),
        status: "pending".to_string(),
        params: Map::new(),
        retry_count: 0,
        parent_task_id: None,
        owner: None,
        claimed_from: None,
        claimed_at: None,
        last_worker: None,
        continuations: 0,
        output_location: None,
        failure_reason: None,
        policy: policy(3),
        created_at: now,
        updated_at: now,
    }
}

pub fn new_task(title: &str, policy: TaskPolicy) -> NewTask {
    NewTask {
        task_type: "generic".to_string(),
        title: title.to_string(),
        description: format!("{title} description"),
        params: Map::new(),
        parent_task_id: None,
        policy,
    }
}

/// Snapshot for `token`; panics on a malformed token.
pub fn snapshot(token: &str, status: WorkerStatus) -> WorkerSnapshot {
    let identity = decode(token).expect("valid token");
    WorkerSnapshot {
        token: token.to_string(),
        role: identity.role,
        depth: identity.depth(),
        status,
        current_task: None,
        tasks_completed: 0,
        tasks_failed: 0,
        uptime_secs: 0,
        updated_at: Utc::now(),
    }
}

/// An initialized workspace in a fresh temp dir.
pub fn workspace() -> (TempDir, SwarmPaths) {
    let temp = tempfile::tempdir().expect("tempdir");
    let paths = init_workspace(temp.path(), &InitOptions::default()).expect("init workspace");
    (temp, paths)
}

/// Write an adapter document into `adapters_dir`.
pub fn write_adapter(adapters_dir: &Path, id: &str, document: &Value) {
    std::fs::create_dir_all(adapters_dir).expect("create adapters dir");
    std::fs::write(
        adapters_dir.join(format!("{id}.json")),
        serde_json::to_string_pretty(document).expect("serialize adapter"),
    )
    .expect("write adapter");
}

/// One scripted provider reaction.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Reply(String),
    /// Reply after a pause; cancellation still interrupts it.
    Delayed(Duration, String),
    Fail(DispatchError),
    /// Block until the dispatch is cancelled.
    WaitForCancel,
}

/// Provider that replays a fixed script and records every instruction.
#[derive(Debug)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    instructions: Mutex<Vec<String>>,
    context_window_tokens: usize,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            instructions: Mutex::new(Vec::new()),
            context_window_tokens: 100_000,
        }
    }

    pub fn replies<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::new(replies.into_iter().map(|r| ScriptStep::Reply(r.into())))
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window_tokens = tokens;
        self
    }

    pub fn instructions(&self) -> Vec<String> {
        self.instructions.lock().expect("instructions lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.steps.lock().expect("steps lock").len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedProvider {
    fn model_id(&self) -> &str {
        "scripted"
    }

    fn context_window_tokens(&self) -> usize {
        self.context_window_tokens
    }

    async fn dispatch(
        &self,
        instruction: &str,
        mut options: DispatchOptions,
    ) -> Result<Dispatch, DispatchError> {
        self.instructions
            .lock()
            .expect("instructions lock")
            .push(instruction.to_string());
        let step = self.steps.lock().expect("steps lock").pop_front();
        match step {
            Some(ScriptStep::Reply(text)) => {
                if let Some(sink) = options.on_chunk.as_mut() {
                    for line in text.split_inclusive('\n') {
                        sink(line);
                    }
                }
                Ok(Dispatch {
                    text,
                    truncated: false,
                    model_id: "scripted".to_string(),
                    duration_ms: 1,
                })
            }
            Some(ScriptStep::Delayed(pause, text)) => {
                tokio::select! {
                    _ = options.cancel.cancelled() => Err(DispatchError::Cancelled),
                    _ = tokio::time::sleep(pause) => Ok(Dispatch {
                        text,
                        truncated: false,
                        model_id: "scripted".to_string(),
                        duration_ms: pause.as_millis() as u64,
                    }),
                }
            }
            Some(ScriptStep::Fail(err)) => Err(err),
            Some(ScriptStep::WaitForCancel) => {
                tokio::select! {
                    _ = options.cancel.cancelled() => Err(DispatchError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {
                        Err(DispatchError::TimedOut(Duration::from_secs(30)))
                    }
                }
            }
            None => Err(DispatchError::Failed("script exhausted".to_string())),
        }
    }
}
