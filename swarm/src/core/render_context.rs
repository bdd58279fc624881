//! Rendering context handed to the template engine.
//!
//! Every field is always present. Missing values are explicit empty strings so
//! template conditionals like `{% if task.parent_task_id %}` behave the same
//! whether or not the source value existed.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::core::identity::WorkerIdentity;
use crate::core::task::{LedgerStats, STATUS_PROCESSING, Task};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderContext {
    pub task: TaskContext,
    pub worker: WorkerContext,
    pub project: LedgerStats,
    pub adapter: AdapterContext,
    pub attempt: AttemptContext,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskContext {
    pub id: u64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub status: String,
    pub params: Map<String, Value>,
    /// Pretty JSON of `params`, or `""` when there are none.
    pub params_pretty: String,
    pub retry_count: u32,
    /// Decimal id of the originating task, or `""`.
    pub parent_task_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerContext {
    pub token: String,
    pub role: String,
    pub depth: u8,
    pub subordinates: u32,
    pub sibling_rank: u32,
    pub uid: u32,
    pub is_manager: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterContext {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptContext {
    pub is_continuation: bool,
    pub continuations: u32,
}

/// Whether a claimed task resumes earlier work rather than starting fresh.
pub fn is_continuation(task: &Task) -> bool {
    task.retry_count > 0 || task.claimed_from.as_deref() == Some(STATUS_PROCESSING)
}

pub fn build_context(
    task: &Task,
    worker: &WorkerIdentity,
    project: LedgerStats,
    adapter: AdapterContext,
) -> RenderContext {
    RenderContext {
        task: TaskContext {
            id: task.id,
            task_type: task.task_type.clone(),
            title: task.title.clone(),
            slug: slugify(&task.title),
            description: task.description.clone(),
            status: task.status.clone(),
            params: task.params.clone(),
            params_pretty: pretty_params(&task.params),
            retry_count: task.retry_count,
            parent_task_id: task
                .parent_task_id
                .map(|id| id.to_string())
                .unwrap_or_default(),
        },
        worker: WorkerContext {
            token: worker.token(),
            role: worker.role.code().to_string(),
            depth: worker.depth(),
            subordinates: worker.subordinate_count,
            sibling_rank: worker.sibling_rank,
            uid: worker.uid,
            is_manager: worker.is_manager(),
        },
        project,
        adapter,
        attempt: AttemptContext {
            is_continuation: is_continuation(task),
            continuations: task.continuations,
        },
    }
}

/// URL-safe slug: lowercase ASCII alphanumerics joined by single dashes.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_dash = false;
    for ch in title.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

fn pretty_params(params: &Map<String, Value>) -> String {
    if params.is_empty() {
        return String::new();
    }
    serde_json::to_string_pretty(params).unwrap_or_default()
}
