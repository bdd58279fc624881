//! Error taxonomy shared across the swarm engine.
//!
//! - **Structural** ([`IdentityError`], [`AdapterError`]): malformed input is
//!   rejected whole, never defaulted.
//! - **Ownership** ([`LedgerError::NotHeld`], [`LedgerError::WrongState`]):
//!   a worker acted on a task it does not hold, or in the wrong status.
//! - **Transient** ([`DispatchError`]): routed through the retry policy.
//!
//! Soft completion misses are not errors and have no variant here.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Structural errors from the hierarchy identity codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("unknown role '{0}'")]
    UnknownRole(String),

    #[error("subordinate count {value} outside [0, {max}]")]
    SubordinatesOutOfRange { value: u32, max: u32 },

    #[error("sibling rank must be >= 1 (got {0})")]
    InvalidSiblingRank(u32),

    #[error("uid {value} outside [1, {max}]")]
    UidOutOfRange { value: u32, max: u32 },

    #[error("malformed identity token '{token}': {reason}")]
    Malformed { token: String, reason: String },

    #[error("role {role} must have {expected} subordinates (got {actual})")]
    SubordinateShape {
        role: String,
        expected: &'static str,
        actual: u32,
    },

    #[error("{child} cannot report to {parent}: expected layer {expected}, got {actual}")]
    LayerMismatch {
        parent: String,
        child: String,
        expected: u8,
        actual: u8,
    },

    #[error("{parent} has no subordinate slots")]
    ParentIsLeaf { parent: String },

    #[error("{parent} declares {declared} subordinates but has {actual}")]
    TooManyChildren {
        parent: String,
        declared: u32,
        actual: usize,
    },

    #[error("sibling ranks for role {role} under {parent} must be 1..={count}")]
    SiblingRanks {
        parent: String,
        role: String,
        count: usize,
    },

    #[error("uid space exhausted (max {max})")]
    UidExhausted { max: u32 },
}

/// Structural errors from loading a behavior definition file.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter '{id}' not found in {}", dir.display())]
    NotFound { id: String, dir: PathBuf },

    #[error("read adapter {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse adapter {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("adapter {} failed schema validation:\n- {}", path.display(), messages.join("\n- "))]
    Schema { path: PathBuf, messages: Vec<String> },

    #[error("adapter '{id}' is invalid: {reason}")]
    Invalid { id: String, reason: String },
}

/// Ledger failures: ownership/state violations and storage problems.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("task {0} not found")]
    NotFound(u64),

    #[error(
        "task {task_id} not held by caller '{caller}' (holder: {})",
        holder.as_deref().unwrap_or("none")
    )]
    NotHeld {
        task_id: u64,
        caller: String,
        holder: Option<String>,
    },

    #[error("task {task_id} is in status '{status}', expected '{expected}'")]
    WrongState {
        task_id: u64,
        status: String,
        expected: String,
    },

    #[error("timed out after {waited:?} waiting for ledger lock {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Failure kinds reported by a language-model provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("quota exceeded or request blocked: {0}")]
    QuotaExceeded(String),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("dispatch timed out after {0:?}")]
    TimedOut(Duration),

    #[error("dispatch failed: {0}")]
    Failed(String),
}

/// Operator-facing description of a failed task attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: u64,
    pub status: String,
    pub reason: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "task {} failed in status '{}': {}",
            self.task_id, self.status, self.reason
        )
    }
}
