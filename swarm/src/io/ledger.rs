//! File-backed task ledger shared by every worker of a workspace.
//!
//! Each operation is one critical section: the in-process mutex, then the
//! cross-process lock file, then load → mutate → atomic write. Transitions
//! themselves live in [`crate::core::ledger_state`].

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::ledger_state::{FailOutcome, LedgerState};
use crate::core::task::{Claimant, LedgerStats, NewTask, Task};
use crate::error::LedgerError;
use crate::io::atomic::write_json_atomic;

const LOCK_RETRY: Duration = Duration::from_millis(5);
const DEFAULT_LOCK_STALE: Duration = Duration::from_secs(30);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    lock_path: PathBuf,
    lock_stale: Duration,
    lock_timeout: Duration,
    guard: Mutex<()>,
}

impl Ledger {
    /// Ledger stored at `path`, locked through a sibling `ledger.lock`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = path.with_file_name("ledger.lock");
        Self {
            path,
            lock_path,
            lock_stale: DEFAULT_LOCK_STALE,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            guard: Mutex::new(()),
        }
    }

    /// Lock files older than `stale` are assumed abandoned and removed.
    pub fn with_lock_stale(mut self, stale: Duration) -> Self {
        self.lock_stale = stale;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create tasks in their initial statuses with contiguous ids.
    #[instrument(skip_all, fields(count = specs.len()))]
    pub fn add_tasks(&self, specs: Vec<NewTask>) -> Result<Vec<Task>, LedgerError> {
        let created = self.transact(|state| Ok(state.add_tasks(specs, Utc::now())))?;
        if let (Some(first), Some(last)) = (created.first(), created.last()) {
            info!(first_id = first.id, last_id = last.id, "tasks added");
        }
        Ok(created)
    }

    /// Claim the oldest eligible task. `None` means there is nothing to do.
    #[instrument(skip_all, fields(worker = %claimant.worker_id))]
    pub fn claim_next_task(&self, claimant: &Claimant) -> Result<Option<Task>, LedgerError> {
        let claimed = self.transact(|state| Ok(state.claim_next(claimant, Utc::now())))?;
        match &claimed {
            Some(task) => {
                info!(task_id = task.id, from = ?task.claimed_from, "task claimed");
            }
            None => debug!("no claimable task"),
        }
        Ok(claimed)
    }

    #[instrument(skip_all, fields(task_id = id, worker = worker_id))]
    pub fn complete_task(
        &self,
        id: u64,
        worker_id: &str,
        output_location: Option<String>,
    ) -> Result<Task, LedgerError> {
        self.complete_task_with_subtasks(id, worker_id, output_location, Vec::new())
            .map(|(task, _)| task)
    }

    /// Complete a task and create its subtasks in the same critical section,
    /// so subtasks exist if and only if the origin completed.
    #[instrument(skip_all, fields(task_id = id, worker = worker_id, subtasks = subtasks.len()))]
    pub fn complete_task_with_subtasks(
        &self,
        id: u64,
        worker_id: &str,
        output_location: Option<String>,
        subtasks: Vec<NewTask>,
    ) -> Result<(Task, Vec<Task>), LedgerError> {
        let (task, created) = self.transact(|state| {
            let now = Utc::now();
            let task = state.complete(id, worker_id, output_location, now)?;
            let created = state.add_tasks(subtasks, now);
            Ok((task, created))
        })?;
        info!(status = %task.status, created = created.len(), "task completed");
        Ok((task, created))
    }

    #[instrument(skip_all, fields(task_id = id, worker = worker_id))]
    pub fn fail_task(
        &self,
        id: u64,
        worker_id: &str,
        reason: &str,
    ) -> Result<FailOutcome, LedgerError> {
        let outcome = self.transact(|state| state.fail(id, worker_id, reason, Utc::now()))?;
        match &outcome {
            FailOutcome::Retrying(task) => {
                info!(
                    retry_count = task.retry_count,
                    status = %task.status,
                    reason,
                    "task re-admitted"
                );
            }
            FailOutcome::Exhausted(task) => {
                warn!(retry_count = task.retry_count, reason, "task failed terminally");
            }
        }
        Ok(outcome)
    }

    /// Release a task as `processing` after a soft completion miss.
    #[instrument(skip_all, fields(task_id = id, worker = worker_id))]
    pub fn mark_processing(
        &self,
        id: u64,
        worker_id: &str,
        note: &str,
    ) -> Result<Task, LedgerError> {
        let task = self.transact(|state| state.mark_processing(id, worker_id, Utc::now()))?;
        info!(continuations = task.continuations, note, "task still processing");
        Ok(task)
    }

    /// Hand a task back without charging a retry.
    #[instrument(skip_all, fields(task_id = id, worker = worker_id))]
    pub fn release_task(&self, id: u64, worker_id: &str) -> Result<Task, LedgerError> {
        let task = self.transact(|state| state.release(id, worker_id, Utc::now()))?;
        info!(status = %task.status, "task released");
        Ok(task)
    }

    /// Push claims older than `lease` through the fail path.
    pub fn reclaim_expired(&self, lease: Duration) -> Result<Vec<FailOutcome>, LedgerError> {
        let lease = chrono::Duration::from_std(lease)
            .context("lease out of range")
            .map_err(LedgerError::Storage)?;
        let reclaimed = self.transact(|state| Ok(state.reclaim_expired(lease, Utc::now())))?;
        for outcome in &reclaimed {
            warn!(
                task_id = outcome.task().id,
                exhausted = outcome.is_exhausted(),
                "expired claim reclaimed"
            );
        }
        Ok(reclaimed)
    }

    /// Advisory counts; may be stale by the time they are read.
    pub fn get_stats(&self) -> Result<LedgerStats, LedgerError> {
        self.read(|state| state.stats())
    }

    pub fn get_task(&self, id: u64) -> Result<Option<Task>, LedgerError> {
        self.read(|state| state.get(id).cloned())
    }

    pub fn tasks(&self) -> Result<Vec<Task>, LedgerError> {
        self.read(|state| state.tasks.clone())
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> Result<T, LedgerError> {
        let _in_process = self.lock_in_process();
        let _file = self.lock_file()?;
        let state = self.load()?;
        Ok(f(&state))
    }

    fn transact<T>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let _in_process = self.lock_in_process();
        let _file = self.lock_file()?;
        let mut state = self.load()?;
        let value = f(&mut state)?;
        write_json_atomic(&self.path, &state)?;
        Ok(value)
    }

    fn load(&self) -> Result<LedgerState, LedgerError> {
        if !self.path.exists() {
            return Ok(LedgerState::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read ledger {}", self.path.display()))?;
        let state = serde_json::from_str(&contents)
            .with_context(|| format!("parse ledger {}", self.path.display()))?;
        Ok(state)
    }

    fn lock_in_process(&self) -> std::sync::MutexGuard<'_, ()> {
        self.guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_file(&self) -> Result<LockFile, LedgerError> {
        let started = Instant::now();
        let nonce = lock_nonce();
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    file.write_all(nonce.as_bytes())
                        .and_then(|()| file.sync_all())
                        .with_context(|| format!("write lock {}", self.lock_path.display()))?;
                    return Ok(LockFile {
                        path: self.lock_path.clone(),
                        nonce,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if self.break_if_stale(&nonce) {
                        continue;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    let parent = self.lock_path.parent().unwrap_or_else(|| Path::new("."));
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create directory {}", parent.display()))?;
                    continue;
                }
                Err(err) => {
                    return Err(LedgerError::Storage(anyhow::Error::new(err).context(format!(
                        "create lock {}",
                        self.lock_path.display()
                    ))));
                }
            }

            let waited = started.elapsed();
            if waited >= self.lock_timeout {
                return Err(LedgerError::LockTimeout {
                    path: self.lock_path.clone(),
                    waited,
                });
            }
            thread::sleep(LOCK_RETRY);
        }
    }

    /// Move a stale lock aside and discard it.
    ///
    /// The lock is renamed to a name only this caller uses, so of several
    /// breakers racing on the same stale file exactly one wins. If the file
    /// that got moved is not the stale one that was observed (someone broke
    /// it and took the lock in between), it is put back untouched.
    fn break_if_stale(&self, nonce: &str) -> bool {
        let Some(observed) = read_stale_lock(&self.lock_path, self.lock_stale) else {
            return false;
        };
        let aside = self.lock_path.with_extension(format!("lock.stale-{nonce}"));
        if fs::rename(&self.lock_path, &aside).is_err() {
            return false;
        }

        let moved = fs::read_to_string(&aside).ok();
        if moved.as_deref() != Some(observed.as_str()) {
            debug!(
                path = %self.lock_path.display(),
                "lock changed hands while breaking; restoring"
            );
            // `hard_link` refuses to overwrite, so a lock created meanwhile wins.
            let _ = fs::hard_link(&aside, &self.lock_path);
            let _ = fs::remove_file(&aside);
            return false;
        }

        warn!(
            path = %self.lock_path.display(),
            holder = %observed.trim(),
            "broke stale ledger lock"
        );
        let _ = fs::remove_file(&aside);
        true
    }
}

/// Contents of the lock at `path` if it is older than `stale`.
fn read_stale_lock(path: &Path, stale: Duration) -> Option<String> {
    let age = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())?;
    if age <= stale {
        return None;
    }
    fs::read_to_string(path).ok()
}

/// Unique per acquisition attempt: pid, a process-wide sequence and the clock.
fn lock_nonce() -> String {
    static SEQ: AtomicU64 = AtomicU64::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{seq}-{nanos}", std::process::id())
}

/// Removes the lock file when dropped, unless it no longer carries our nonce.
struct LockFile {
    path: PathBuf,
    nonce: String,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents == self.nonce => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), err = %err, "failed to remove ledger lock");
                }
            }
            Ok(_) => {
                warn!(
                    path = %self.path.display(),
                    "ledger lock was taken over; leaving it in place"
                );
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    err = %err,
                    "ledger lock vanished before release"
                );
            }
        }
    }
}
