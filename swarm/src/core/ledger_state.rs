//! Ledger-owned task transitions over an in-memory task list.
//!
//! These functions define every status change the ledger performs. The file
//! store in `io::ledger` wraps each call in a single locked load → mutate →
//! write cycle, which is what makes them atomic across workers.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::task::{
    Claimant, LedgerStats, NewTask, STATUS_FAILED, STATUS_IN_PROGRESS, STATUS_PROCESSING, Task,
};
use crate::error::LedgerError;

/// Persisted ledger document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub next_id: u64,
    pub tasks: Vec<Task>,
}

impl Default for LedgerState {
    fn default() -> Self {
        Self {
            next_id: 1,
            tasks: Vec::new(),
        }
    }
}

/// Result of `fail`: whether the task was re-admitted or is now terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying(Task),
    Exhausted(Task),
}

impl FailOutcome {
    pub fn task(&self) -> &Task {
        match self {
            FailOutcome::Retrying(task) | FailOutcome::Exhausted(task) => task,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FailOutcome::Exhausted(_))
    }
}

impl LedgerState {
    pub fn stats(&self) -> LedgerStats {
        LedgerStats::from_tasks(&self.tasks)
    }

    pub fn get(&self, id: u64) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    /// Create one task per spec with contiguous ids, each in its initial status.
    pub fn add_tasks(&mut self, specs: Vec<NewTask>, now: DateTime<Utc>) -> Vec<Task> {
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            let task = Task {
                id: self.next_id,
                task_type: spec.task_type,
                title: spec.title,
                description: spec.description,
                status: spec.policy.initial_status.clone(),
                params: spec.params,
                retry_count: 0,
                parent_task_id: spec.parent_task_id,
                owner: None,
                claimed_from: None,
                claimed_at: None,
                last_worker: None,
                continuations: 0,
                output_location: None,
                failure_reason: None,
                policy: spec.policy,
                created_at: now,
                updated_at: now,
            };
            self.next_id += 1;
            self.tasks.push(task.clone());
            created.push(task);
        }
        created
    }

    /// Hand the oldest claimable task to `claimant`, marking it in progress.
    pub fn claim_next(&mut self, claimant: &Claimant, now: DateTime<Utc>) -> Option<Task> {
        let task = self
            .tasks
            .iter_mut()
            .filter(|task| task.is_claimable())
            .filter(|task| claimant.manager_capable || !task.policy.requires_manager)
            .min_by_key(|task| task.id)?;

        task.claimed_from = Some(std::mem::replace(
            &mut task.status,
            STATUS_IN_PROGRESS.to_string(),
        ));
        task.owner = Some(claimant.worker_id.clone());
        task.last_worker = Some(claimant.worker_id.clone());
        task.claimed_at = Some(now);
        task.updated_at = now;
        Some(task.clone())
    }

    /// Move a held task to its success status.
    pub fn complete(
        &mut self,
        id: u64,
        worker_id: &str,
        output_location: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Task, LedgerError> {
        let task = self.held_mut(id, worker_id)?;
        task.status = task.policy.success_status.clone();
        task.output_location = output_location;
        task.failure_reason = None;
        release_claim(task, now);
        Ok(task.clone())
    }

    /// Apply the retry policy to a held task.
    ///
    /// A claim that started from `processing` is retried from the initial
    /// status. Re-admission resets the continuation counter.
    pub fn fail(
        &mut self,
        id: u64,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOutcome, LedgerError> {
        let task = self.held_mut(id, worker_id)?;
        let from = task
            .claimed_from
            .clone()
            .unwrap_or_else(|| task.policy.initial_status.clone());
        let target = if from == STATUS_PROCESSING {
            task.policy.initial_status.clone()
        } else {
            from
        };

        task.failure_reason = Some(reason.to_string());
        let retry = task.retry_count < task.policy.max_retries && task.policy.is_retryable(&target);
        if retry {
            task.retry_count += 1;
            task.continuations = 0;
            task.status = target;
        } else {
            task.status = STATUS_FAILED.to_string();
        }
        release_claim(task, now);

        let snapshot = task.clone();
        Ok(if retry {
            FailOutcome::Retrying(snapshot)
        } else {
            FailOutcome::Exhausted(snapshot)
        })
    }

    /// Release a held task as `processing` after a soft completion miss.
    pub fn mark_processing(
        &mut self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, LedgerError> {
        let task = self.held_mut(id, worker_id)?;
        task.status = STATUS_PROCESSING.to_string();
        task.continuations += 1;
        release_claim(task, now);
        Ok(task.clone())
    }

    /// Return a held task to the status it was claimed from, without charging
    /// a retry. Used when a worker is stopped mid-dispatch.
    pub fn release(
        &mut self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Task, LedgerError> {
        let task = self.held_mut(id, worker_id)?;
        task.status = task
            .claimed_from
            .clone()
            .unwrap_or_else(|| task.policy.initial_status.clone());
        release_claim(task, now);
        Ok(task.clone())
    }

    /// Fail every claim older than `lease` on behalf of its holder.
    pub fn reclaim_expired(&mut self, lease: Duration, now: DateTime<Utc>) -> Vec<FailOutcome> {
        let expired: Vec<(u64, String)> = self
            .tasks
            .iter()
            .filter(|task| task.status == STATUS_IN_PROGRESS)
            .filter(|task| task.claimed_at.is_none_or(|at| now - at > lease))
            .filter_map(|task| task.owner.clone().map(|owner| (task.id, owner)))
            .collect();

        expired
            .into_iter()
            .filter_map(|(id, owner)| self.fail(id, &owner, "lease expired", now).ok())
            .collect()
    }

    fn held_mut(&mut self, id: u64, worker_id: &str) -> Result<&mut Task, LedgerError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or(LedgerError::NotFound(id))?;
        if task.owner.as_deref() != Some(worker_id) {
            return Err(LedgerError::NotHeld {
                task_id: id,
                caller: worker_id.to_string(),
                holder: task.owner.clone(),
            });
        }
        if task.status != STATUS_IN_PROGRESS {
            return Err(LedgerError::WrongState {
                task_id: id,
                status: task.status.clone(),
                expected: STATUS_IN_PROGRESS.to_string(),
            });
        }
        Ok(task)
    }
}

fn release_claim(task: &mut Task, now: DateTime<Utc>) {
    task.owner = None;
    task.claimed_from = None;
    task.claimed_at = None;
    task.updated_at = now;
}
