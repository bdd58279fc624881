//! Reporting rollups: worker snapshots → manager reports → root overview.
//!
//! Everything here is a pure function of persisted snapshots and ledger
//! contents; nothing is invented that was not already recorded.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::identity::{Role, WorkerIdentity};
use crate::core::task::{LedgerStats, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
    Completed,
    Error,
}

/// One worker's self-reported state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub token: String,
    pub role: Role,
    pub depth: u8,
    pub status: WorkerStatus,
    pub current_task: Option<u64>,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub uptime_secs: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub idle: usize,
    pub working: usize,
    pub completed: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn from_snapshots<'a>(snapshots: impl IntoIterator<Item = &'a WorkerSnapshot>) -> Self {
        let mut counts = Self::default();
        for snapshot in snapshots {
            match snapshot.status {
                WorkerStatus::Idle => counts.idle += 1,
                WorkerStatus::Working => counts.working += 1,
                WorkerStatus::Completed => counts.completed += 1,
                WorkerStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.idle + self.working + self.completed + self.error
    }
}

/// Rollup for one management scope (a manager and everyone beneath it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerReport {
    pub manager: String,
    pub role: Role,
    pub workers_total: usize,
    pub workers: StatusCounts,
    pub tasks: LedgerStats,
    pub snapshots: Vec<WorkerSnapshot>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeProgress {
    pub scope: String,
    pub progress_pct: f64,
    pub workers_total: usize,
    pub tasks_completed: usize,
    pub tasks_total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootReport {
    pub scopes: Vec<ScopeProgress>,
    pub total: ScopeProgress,
    pub generated_at: DateTime<Utc>,
}

/// `completed / total` as a percentage; 0 when there is nothing to do.
pub fn progress_pct(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    completed as f64 / total as f64 * 100.0
}

/// Ledger statistics restricted to tasks last held by a worker in `scope`.
pub fn scope_stats<'a>(
    tasks: impl IntoIterator<Item = &'a Task>,
    scope: &HashSet<String>,
) -> LedgerStats {
    LedgerStats::from_tasks(tasks.into_iter().filter(|task| {
        task.last_worker
            .as_ref()
            .is_some_and(|worker| scope.contains(worker))
    }))
}

pub fn manager_rollup(
    manager: &WorkerIdentity,
    workers: &[WorkerSnapshot],
    tasks: LedgerStats,
    now: DateTime<Utc>,
) -> ManagerReport {
    ManagerReport {
        manager: manager.token(),
        role: manager.role,
        workers_total: workers.len(),
        workers: StatusCounts::from_snapshots(workers),
        tasks,
        snapshots: workers.to_vec(),
        generated_at: now,
    }
}

/// Scope row for ledger tasks no manager scope accounts for: never claimed,
/// or last held outside every scope (the root itself, a departed worker).
pub const UNASSIGNED_SCOPE: &str = "unassigned";

/// Roll manager scopes up into the overview.
///
/// `ledger` covers every task, so the total always matches the ledger. The
/// difference between it and the summed scopes is reported as
/// [`UNASSIGNED_SCOPE`]; scopes are disjoint subtrees, so nothing is counted
/// twice.
pub fn root_rollup(
    managers: &[ManagerReport],
    ledger: &LedgerStats,
    now: DateTime<Utc>,
) -> RootReport {
    let mut scopes: Vec<ScopeProgress> = managers
        .iter()
        .map(|report| ScopeProgress {
            scope: report.manager.clone(),
            progress_pct: progress_pct(report.tasks.completed, report.tasks.total),
            workers_total: report.workers_total,
            tasks_completed: report.tasks.completed,
            tasks_total: report.tasks.total,
        })
        .collect();

    let scoped_total: usize = scopes.iter().map(|s| s.tasks_total).sum();
    let scoped_completed: usize = scopes.iter().map(|s| s.tasks_completed).sum();
    let unassigned_total = ledger.total.saturating_sub(scoped_total);
    if unassigned_total > 0 {
        let unassigned_completed = ledger.completed.saturating_sub(scoped_completed);
        scopes.push(ScopeProgress {
            scope: UNASSIGNED_SCOPE.to_string(),
            progress_pct: progress_pct(unassigned_completed, unassigned_total),
            workers_total: 0,
            tasks_completed: unassigned_completed,
            tasks_total: unassigned_total,
        });
    }

    let workers_total = scopes.iter().map(|s| s.workers_total).sum();
    RootReport {
        total: ScopeProgress {
            scope: "total".to_string(),
            progress_pct: progress_pct(ledger.completed, ledger.total),
            workers_total,
            tasks_completed: ledger.completed,
            tasks_total: ledger.total,
        },
        scopes,
        generated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{snapshot, task};

    #[test]
    fn progress_is_zero_without_tasks() {
        assert_eq!(progress_pct(0, 0), 0.0);
        assert_eq!(progress_pct(1, 4), 25.0);
    }

    #[test]
    fn manager_rollup_counts_workers_by_status() {
        let lead = WorkerIdentity::new(Role::Lead, 3, 1, 2).expect("identity");
        let workers = vec![
            snapshot("HIVE_DEV_W0_S1_U00003", WorkerStatus::Working),
            snapshot("HIVE_DEV_W0_S2_U00004", WorkerStatus::Idle),
            snapshot("HIVE_QA_W0_S1_U00005", WorkerStatus::Working),
        ];
        let stats = LedgerStats {
            total: 4,
            completed: 1,
            ..LedgerStats::default()
        };

        let report = manager_rollup(&lead, &workers, stats, Utc::now());
        assert_eq!(report.workers_total, 3);
        assert_eq!(report.workers.working, 2);
        assert_eq!(report.workers.idle, 1);
        assert_eq!(report.workers.total(), 3);
        assert_eq!(report.tasks.total, 4);
    }

    #[test]
    fn root_rollup_sums_scopes() {
        let cto = WorkerIdentity::new(Role::Cto, 1, 1, 2).expect("identity");
        let coo = WorkerIdentity::new(Role::Coo, 1, 1, 3).expect("identity");
        let now = Utc::now();
        let a = manager_rollup(
            &cto,
            &[snapshot("HIVE_LEAD_W1_S1_U00004", WorkerStatus::Idle)],
            LedgerStats {
                total: 4,
                completed: 3,
                ..LedgerStats::default()
            },
            now,
        );
        let b = manager_rollup(&coo, &[], LedgerStats::default(), now);
        let ledger = LedgerStats {
            total: 4,
            completed: 3,
            ..LedgerStats::default()
        };

        let root = root_rollup(&[a, b], &ledger, now);
        assert_eq!(root.scopes.len(), 2);
        assert_eq!(root.scopes[0].progress_pct, 75.0);
        assert_eq!(root.scopes[1].progress_pct, 0.0);
        assert_eq!(root.total.tasks_total, 4);
        assert_eq!(root.total.tasks_completed, 3);
        assert_eq!(root.total.workers_total, 1);
    }

    #[test]
    fn root_rollup_reports_unattributed_tasks_as_unassigned() {
        let cto = WorkerIdentity::new(Role::Cto, 1, 1, 2).expect("identity");
        let now = Utc::now();
        let scoped = manager_rollup(
            &cto,
            &[],
            LedgerStats {
                total: 2,
                completed: 1,
                ..LedgerStats::default()
            },
            now,
        );
        let ledger = LedgerStats {
            total: 10,
            pending: 7,
            completed: 3,
            ..LedgerStats::default()
        };

        let root = root_rollup(&[scoped], &ledger, now);
        assert_eq!(root.total.tasks_total, 10);
        assert_eq!(root.total.tasks_completed, 3);
        assert_eq!(root.total.progress_pct, 30.0);
        let unassigned = root.scopes.last().expect("unassigned scope");
        assert_eq!(unassigned.scope, UNASSIGNED_SCOPE);
        assert_eq!(unassigned.tasks_total, 8);
        assert_eq!(unassigned.tasks_completed, 2);
        assert_eq!(unassigned.workers_total, 0);
    }

    #[test]
    fn scope_stats_only_counts_tasks_touched_in_scope() {
        let mut tasks = vec![task(1), task(2), task(3)];
        tasks[0].last_worker = Some("A".to_string());
        tasks[0].status = "completed".to_string();
        tasks[1].last_worker = Some("B".to_string());

        let scope: HashSet<String> = ["A".to_string()].into_iter().collect();
        let stats = scope_stats(&tasks, &scope);
        assert_eq!(stats.total, 1);
        assert_eq!(stats.completed, 1);
    }
}
