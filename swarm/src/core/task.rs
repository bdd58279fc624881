//! Task records and the ledger-facing policy snapshot.
//!
//! Statuses are strings: most come from the adapter's status flow, while three
//! are reserved by the ledger itself ([`STATUS_IN_PROGRESS`],
//! [`STATUS_PROCESSING`], [`STATUS_FAILED`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Held by exactly one worker.
pub const STATUS_IN_PROGRESS: &str = "in_progress";
/// Released after a soft completion miss; claimable for continuation.
pub const STATUS_PROCESSING: &str = "processing";
/// Terminal failure.
pub const STATUS_FAILED: &str = "failed";

pub const RESERVED_STATUSES: [&str; 3] = [STATUS_IN_PROGRESS, STATUS_PROCESSING, STATUS_FAILED];

/// Subset of the adapter that governs ledger transitions.
///
/// Copied onto each task at creation; adapters are immutable after load so the
/// copy never goes stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPolicy {
    pub initial_status: String,
    pub success_status: String,
    pub retryable_statuses: Vec<String>,
    pub max_retries: u32,
    #[serde(default)]
    pub requires_manager: bool,
}

impl TaskPolicy {
    pub fn is_retryable(&self, status: &str) -> bool {
        self.retryable_statuses.iter().any(|s| s == status)
    }

    /// Whether a task sitting in `status` may be claimed.
    pub fn is_claimable(&self, status: &str) -> bool {
        if status == STATUS_IN_PROGRESS || status == STATUS_FAILED || status == self.success_status
        {
            return false;
        }
        status == self.initial_status || status == STATUS_PROCESSING || self.is_retryable(status)
    }
}

/// Input to `Ledger::add_tasks`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub task_type: String,
    pub title: String,
    pub description: String,
    pub params: Map<String, Value>,
    pub parent_task_id: Option<u64>,
    pub policy: TaskPolicy,
}

/// A unit of work as persisted by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub title: String,
    pub description: String,
    pub status: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub retry_count: u32,
    pub parent_task_id: Option<u64>,
    /// Worker token of the current holder while `in_progress`.
    pub owner: Option<String>,
    /// Status the current claim started from.
    pub claimed_from: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Worker token of the most recent holder, kept after release.
    pub last_worker: Option<String>,
    /// Soft completion misses since the last re-admission.
    #[serde(default)]
    pub continuations: u32,
    pub output_location: Option<String>,
    pub failure_reason: Option<String>,
    pub policy: TaskPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Coarse classification used by statistics and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCategory {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl Task {
    pub fn category(&self) -> TaskCategory {
        if self.status == self.policy.success_status {
            TaskCategory::Completed
        } else if self.status == STATUS_FAILED {
            TaskCategory::Failed
        } else if self.status == STATUS_IN_PROGRESS || self.status == STATUS_PROCESSING {
            TaskCategory::Processing
        } else {
            TaskCategory::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.category(),
            TaskCategory::Completed | TaskCategory::Failed
        )
    }

    pub fn is_claimable(&self) -> bool {
        self.owner.is_none() && self.policy.is_claimable(&self.status)
    }
}

/// Point-in-time task counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl LedgerStats {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        for task in tasks {
            stats.total += 1;
            match task.category() {
                TaskCategory::Pending => stats.pending += 1,
                TaskCategory::Processing => stats.processing += 1,
                TaskCategory::Completed => stats.completed += 1,
                TaskCategory::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

/// The worker asking for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimant {
    pub worker_id: String,
    /// Whether manager-only task types may be handed to this worker.
    pub manager_capable: bool,
}

impl Claimant {
    pub fn new(worker_id: impl Into<String>, manager_capable: bool) -> Self {
        Self {
            worker_id: worker_id.into(),
            manager_capable,
        }
    }
}
