//! Worker run loops for `swarm run`.
//!
//! Each organization member claims and executes tasks until the ledger has
//! nothing it may take or the run is cancelled. Workers publish a
//! `status.json` snapshot at every state change for the reporting side.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::report::{WorkerSnapshot, WorkerStatus};
use crate::io::org::{OrgMember, Organization};
use crate::io::report_store::write_worker_status;
use crate::orchestrator::{ExecutionOutcome, Orchestrator};

/// File under each worker directory receiving streamed dispatch output.
pub const STREAM_LOG: &str = "stream.log";

/// Reason why `run_worker` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// No task the worker may claim remains.
    Drained,
    /// The cancellation token fired.
    Cancelled,
}

/// Summary of one worker's loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub stop: LoopStop,
    pub iterations: u32,
    pub completed: u32,
    pub still_processing: u32,
    pub failed: u32,
    pub released: u32,
    /// Attempts whose claim expired and was reclaimed before they finished.
    pub claims_lost: u32,
}

impl LoopOutcome {
    fn new() -> Self {
        Self {
            stop: LoopStop::Drained,
            iterations: 0,
            completed: 0,
            still_processing: 0,
            failed: 0,
            released: 0,
            claims_lost: 0,
        }
    }

    fn record(&mut self, outcome: &ExecutionOutcome) {
        self.iterations += 1;
        match outcome {
            ExecutionOutcome::Completed { .. } => self.completed += 1,
            ExecutionOutcome::StillProcessing { .. } => self.still_processing += 1,
            ExecutionOutcome::Failed { .. } => self.failed += 1,
            ExecutionOutcome::Released { .. } => self.released += 1,
            ExecutionOutcome::ClaimLost { .. } => self.claims_lost += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopOptions {
    /// Pause between iterations; cancellable.
    pub pause: Duration,
    /// Reclaim claims older than this before each claim.
    pub lease: Option<Duration>,
}

/// One finished worker loop, keyed by identity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRun {
    pub token: String,
    pub outcome: LoopOutcome,
}

/// Totals across every worker of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwarmOutcome {
    pub workers: Vec<WorkerRun>,
    pub cancelled: bool,
}

impl SwarmOutcome {
    pub fn completed(&self) -> u32 {
        self.workers.iter().map(|w| w.outcome.completed).sum()
    }

    pub fn failed(&self) -> u32 {
        self.workers.iter().map(|w| w.outcome.failed).sum()
    }
}

/// Claim → execute until drained or cancelled.
///
/// Ledger failures stop the loop with an error after publishing an `error`
/// snapshot; everything else is absorbed by the orchestrator.
#[instrument(skip_all, fields(worker = %member.identity))]
pub async fn run_worker(
    orchestrator: &Orchestrator,
    member: &OrgMember,
    options: &LoopOptions,
    cancel: CancellationToken,
) -> Result<LoopOutcome> {
    let mut status = StatusPublisher::new(member);
    let mut outcome = LoopOutcome::new();
    let stream_log = member.dir.join(STREAM_LOG);
    status.publish(WorkerStatus::Idle, None);

    loop {
        if cancel.is_cancelled() {
            outcome.stop = LoopStop::Cancelled;
            break;
        }

        if let Some(lease) = options.lease {
            let reclaimed = orchestrator.reclaim_expired(lease).await;
            if let Err(err) = reclaimed {
                status.publish(WorkerStatus::Error, None);
                return Err(err).context("reclaim expired claims");
            }
        }

        let claimed = match orchestrator.claim_next(&member.identity).await {
            Ok(claimed) => claimed,
            Err(err) => {
                status.publish(WorkerStatus::Error, None);
                return Err(err).context("claim next task");
            }
        };
        let Some(task) = claimed else {
            debug!("nothing to claim");
            outcome.stop = LoopStop::Drained;
            break;
        };

        status.publish(WorkerStatus::Working, Some(task.id));
        let executed = orchestrator
            .execute_task(&task, &member.identity, Some(&stream_log), &cancel)
            .await;
        let executed = match executed {
            Ok(executed) => executed,
            Err(err) => {
                status.publish(WorkerStatus::Error, Some(task.id));
                return Err(err).with_context(|| format!("execute task {}", task.id));
            }
        };
        outcome.record(&executed);
        match &executed {
            ExecutionOutcome::Completed { .. } => {
                status.tasks_completed += 1;
                status.publish(WorkerStatus::Completed, None);
            }
            ExecutionOutcome::Failed { .. } => {
                status.tasks_failed += 1;
                status.publish(WorkerStatus::Error, None);
            }
            ExecutionOutcome::StillProcessing { .. }
            | ExecutionOutcome::Released { .. }
            | ExecutionOutcome::ClaimLost { .. } => {
                status.publish(WorkerStatus::Idle, None);
            }
        }

        if !options.pause.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(options.pause) => {}
            }
        }
    }

    status.publish(WorkerStatus::Idle, None);
    info!(
        stop = ?outcome.stop,
        iterations = outcome.iterations,
        completed = outcome.completed,
        failed = outcome.failed,
        "worker stopped"
    );
    Ok(outcome)
}

/// Run every member of `org` concurrently until all stop.
pub async fn run_swarm(
    orchestrator: Arc<Orchestrator>,
    org: &Organization,
    options: LoopOptions,
    cancel: CancellationToken,
) -> Result<SwarmOutcome> {
    let mut workers = JoinSet::new();
    for member in org.members.iter().cloned() {
        let orchestrator = Arc::clone(&orchestrator);
        let options = options.clone();
        let cancel = cancel.child_token();
        workers.spawn(async move {
            let token = member.token();
            let outcome = run_worker(&orchestrator, &member, &options, cancel).await;
            (token, outcome)
        });
    }

    let mut out = SwarmOutcome::default();
    let mut first_error = None;
    while let Some(joined) = workers.join_next().await {
        let (token, outcome) = joined.context("worker task panicked")?;
        match outcome {
            Ok(outcome) => out.workers.push(WorkerRun { token, outcome }),
            Err(err) => {
                warn!(worker = %token, err = ?err, "worker stopped on error");
                first_error.get_or_insert(err);
            }
        }
    }
    if let Some(err) = first_error {
        return Err(err);
    }
    out.workers.sort_by(|a, b| a.token.cmp(&b.token));
    out.cancelled = cancel.is_cancelled();
    Ok(out)
}

struct StatusPublisher<'a> {
    member: &'a OrgMember,
    started: Instant,
    tasks_completed: u32,
    tasks_failed: u32,
}

impl<'a> StatusPublisher<'a> {
    fn new(member: &'a OrgMember) -> Self {
        Self {
            member,
            started: Instant::now(),
            tasks_completed: 0,
            tasks_failed: 0,
        }
    }

    fn publish(&self, status: WorkerStatus, current_task: Option<u64>) {
        let snapshot = WorkerSnapshot {
            token: self.member.token(),
            role: self.member.identity.role,
            depth: self.member.identity.depth(),
            status,
            current_task,
            tasks_completed: self.tasks_completed,
            tasks_failed: self.tasks_failed,
            uptime_secs: self.started.elapsed().as_secs(),
            updated_at: Utc::now(),
        };
        if let Err(err) = write_worker_status(&self.member.dir, &snapshot) {
            warn!(err = ?err, "failed to publish worker status");
        }
    }
}
