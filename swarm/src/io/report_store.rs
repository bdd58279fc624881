//! Report persistence: worker `status.json`, manager `report.json` (+ history),
//! and the root overview under `.swarm/reports/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::core::report::{
    ManagerReport, RootReport, WorkerSnapshot, manager_rollup, root_rollup, scope_stats,
};
use crate::core::task::{LedgerStats, Task};
use crate::io::atomic::write_json_atomic;
use crate::io::org::{OrgMember, Organization};

pub const STATUS_FILE: &str = "status.json";
pub const REPORT_FILE: &str = "report.json";
pub const HISTORY_DIR: &str = "history";

pub fn write_worker_status(worker_dir: &Path, snapshot: &WorkerSnapshot) -> Result<()> {
    write_json_atomic(&worker_dir.join(STATUS_FILE), snapshot)
}

/// Read a worker's last snapshot; `None` if it never reported.
pub fn load_worker_status(worker_dir: &Path) -> Result<Option<WorkerSnapshot>> {
    let path = worker_dir.join(STATUS_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read status {}", path.display()))?;
    let snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parse status {}", path.display()))?;
    Ok(Some(snapshot))
}

/// Write `report.json` and archive a timestamped copy; returns the archive path.
pub fn write_manager_report(manager_dir: &Path, report: &ManagerReport) -> Result<PathBuf> {
    write_json_atomic(&manager_dir.join(REPORT_FILE), report)?;
    let archive = manager_dir
        .join(HISTORY_DIR)
        .join(format!("report-{}.json", history_stamp(report.generated_at)));
    write_json_atomic(&archive, report)?;
    Ok(archive)
}

pub fn load_manager_report(manager_dir: &Path) -> Result<ManagerReport> {
    let path = manager_dir.join(REPORT_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read report {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse report {}", path.display()))
}

pub fn write_overview(path: &Path, report: &RootReport) -> Result<()> {
    write_json_atomic(path, report)
}

fn history_stamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Roll every manager scope up from persisted snapshots and ledger tasks,
/// write all reports, and return the root overview.
///
/// Overview totals cover the whole ledger, including tasks no worker has
/// claimed yet.
#[instrument(skip_all, fields(workers = org.members.len(), tasks = tasks.len()))]
pub fn aggregate_reports(
    org: &Organization,
    tasks: &[Task],
    overview_path: &Path,
    now: DateTime<Utc>,
) -> Result<RootReport> {
    let mut scope_reports = Vec::new();
    let root = org.root();

    for manager in org.managers() {
        let report = manager_report(org, manager, tasks, now)?;
        write_manager_report(&manager.dir, &report)?;
        debug!(manager = %report.manager, workers = report.workers_total, "manager report written");
        if manager.parent.as_ref() == root.map(|r| &r.identity) {
            scope_reports.push(report);
        }
    }

    // A lone root reports on itself.
    if scope_reports.is_empty()
        && let Some(root) = root
    {
        let snapshots: Vec<WorkerSnapshot> = load_worker_status(&root.dir)?.into_iter().collect();
        let stats = scope_stats(tasks, &org.scope_tokens(&root.identity));
        scope_reports.push(manager_rollup(&root.identity, &snapshots, stats, now));
    }

    let overview = root_rollup(&scope_reports, &LedgerStats::from_tasks(tasks), now);
    write_overview(overview_path, &overview)?;
    Ok(overview)
}

fn manager_report(
    org: &Organization,
    manager: &OrgMember,
    tasks: &[Task],
    now: DateTime<Utc>,
) -> Result<ManagerReport> {
    let mut snapshots = Vec::new();
    for member in org.descendants_of(&manager.identity) {
        match load_worker_status(&member.dir) {
            Ok(Some(snapshot)) => snapshots.push(snapshot),
            Ok(None) => {}
            Err(err) => warn!(worker = %member.identity, err = ?err, "skipping unreadable status"),
        }
    }
    snapshots.sort_by_key(|s| s.token.clone());
    let stats = scope_stats(tasks, &org.scope_tokens(&manager.identity));
    Ok(manager_rollup(&manager.identity, &snapshots, stats, now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::org::default_org;
    use crate::core::report::{UNASSIGNED_SCOPE, WorkerStatus};
    use crate::core::uid::UidCounter;
    use crate::io::org::materialize_org;
    use crate::test_support::{snapshot, task};

    #[test]
    fn manager_report_is_archived_with_timestamp() {
        let temp = tempfile::tempdir().expect("tempdir");
        let report = ManagerReport {
            manager: "HIVE_LEAD_W1_S1_U00002".to_string(),
            role: crate::core::identity::Role::Lead,
            workers_total: 0,
            workers: Default::default(),
            tasks: Default::default(),
            snapshots: Vec::new(),
            generated_at: "2024-05-01T12:30:00.250Z".parse().expect("timestamp"),
        };
        let archive = write_manager_report(temp.path(), &report).expect("write");
        assert_eq!(
            archive,
            temp.path()
                .join("history")
                .join("report-20240501T123000.250Z.json")
        );
        assert_eq!(load_manager_report(temp.path()).expect("load"), report);
    }

    #[test]
    fn aggregate_rolls_snapshots_and_tasks_up_to_the_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let org = materialize_org(&temp.path().join("org"), &default_org(), &UidCounter::new())
            .expect("org");
        let dev = org
            .members
            .iter()
            .find(|m| m.token() == "HIVE_DEV_W0_S1_U00004")
            .expect("dev");
        write_worker_status(&dev.dir, &snapshot(&dev.token(), WorkerStatus::Completed))
            .expect("status");

        let mut tasks = vec![task(1), task(2)];
        tasks[0].status = "completed".to_string();
        tasks[0].last_worker = Some(dev.token());
        tasks[1].last_worker = Some("HIVE_DEV_W0_S9_U00099".to_string());

        let overview_path = temp.path().join("reports").join("overview.json");
        let overview =
            aggregate_reports(&org, &tasks, &overview_path, Utc::now()).expect("aggregate");

        assert_eq!(overview.scopes.len(), 2);
        assert_eq!(overview.scopes[0].scope, "HIVE_CTO_W1_S1_U00002");
        assert_eq!(overview.scopes[0].tasks_total, 1);
        assert_eq!(overview.scopes[0].progress_pct, 100.0);
        assert_eq!(overview.scopes[1].scope, UNASSIGNED_SCOPE);
        assert_eq!(overview.scopes[1].tasks_total, 1);
        assert_eq!(overview.total.tasks_total, 2);
        assert_eq!(overview.total.progress_pct, 50.0);
        assert_eq!(overview.total.workers_total, 1);
        assert!(overview_path.exists());

        let lead = org
            .members
            .iter()
            .find(|m| m.token() == "HIVE_LEAD_W3_S1_U00003")
            .expect("lead");
        let lead_report = load_manager_report(&lead.dir).expect("lead report");
        assert_eq!(lead_report.workers.completed, 1);
        assert!(lead.dir.join("history").is_dir());
    }

    #[test]
    fn overview_counts_unclaimed_and_root_held_tasks() {
        let temp = tempfile::tempdir().expect("tempdir");
        let org = materialize_org(&temp.path().join("org"), &default_org(), &UidCounter::new())
            .expect("org");
        let root = org.root().expect("root").token();

        let mut tasks: Vec<_> = (1..=10).map(task).collect();
        tasks[9].status = "completed".to_string();
        tasks[9].last_worker = Some(root);

        let overview_path = temp.path().join("reports").join("overview.json");
        let overview =
            aggregate_reports(&org, &tasks, &overview_path, Utc::now()).expect("aggregate");

        assert_eq!(overview.total.tasks_total, 10);
        assert_eq!(overview.total.tasks_completed, 1);
        assert_eq!(overview.total.progress_pct, 10.0);
        let unassigned = overview
            .scopes
            .iter()
            .find(|s| s.scope == UNASSIGNED_SCOPE)
            .expect("unassigned scope");
        assert_eq!(unassigned.tasks_total, 10);
        assert_eq!(unassigned.tasks_completed, 1);
    }
}
