//! Execution of a single claimed task.
//!
//! One attempt walks `Claimed → AdapterResolved → ContextBuilt → Dispatched →
//! CriteriaEvaluated` and ends in exactly one ledger transition: complete,
//! mark processing, fail, or release. The orchestrator never leaves a task it
//! claimed in `in_progress` unless the ledger itself is unreachable. If the
//! claim expired and was reclaimed meanwhile, the transition is refused and
//! the attempt's result is discarded.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::ContextFit;
use crate::core::criteria::evaluate;
use crate::core::decompose::{SubtaskSpec, subtasks_from_output};
use crate::core::identity::WorkerIdentity;
use crate::core::ledger_state::FailOutcome;
use crate::core::render_context::build_context;
use crate::core::task::{Claimant, NewTask, Task};
use crate::error::{DispatchError, LedgerError, TaskFailure};
use crate::io::adapter::{AdapterLoader, GENERIC_ADAPTER_ID, TaskAdapter};
use crate::io::config::SwarmConfig;
use crate::io::ledger::Ledger;
use crate::io::output::write_output;
use crate::io::prompt::PromptEngine;
use crate::io::provider::{ChunkSink, DispatchOptions, LanguageModel};

/// Execution knobs taken from `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSettings {
    pub completion_markers: Vec<String>,
    /// Dispatches allowed before a soft miss escalates to a failure.
    pub max_continuations: u32,
}

impl ExecSettings {
    pub fn from_config(cfg: &SwarmConfig) -> Self {
        Self {
            completion_markers: cfg.completion_markers.clone(),
            max_continuations: cfg.max_continuations,
        }
    }
}

impl Default for ExecSettings {
    fn default() -> Self {
        Self::from_config(&SwarmConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Claimed,
    AdapterResolved,
    ContextBuilt,
    Dispatched,
    CriteriaEvaluated,
    Completed,
    StillProcessing,
    Failed,
    Released,
    ClaimLost,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Claimed => "claimed",
            Phase::AdapterResolved => "adapter_resolved",
            Phase::ContextBuilt => "context_built",
            Phase::Dispatched => "dispatched",
            Phase::CriteriaEvaluated => "criteria_evaluated",
            Phase::Completed => "completed",
            Phase::StillProcessing => "still_processing",
            Phase::Failed => "failed",
            Phase::Released => "released",
            Phase::ClaimLost => "claim_lost",
        }
    }
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed {
        task_id: u64,
        output_path: PathBuf,
        /// Ids of subtasks created alongside completion.
        subtasks: Vec<u64>,
    },
    /// Soft miss: the task went back to `processing` for another dispatch.
    StillProcessing {
        task_id: u64,
        continuations: u32,
        shortfalls: Vec<String>,
    },
    Failed {
        failure: TaskFailure,
        /// True when no retries remain and the task is now `failed`.
        exhausted: bool,
    },
    /// Cancelled mid-dispatch; the task was handed back untouched.
    Released { task_id: u64 },
    /// The claim expired and was reclaimed before the attempt finished; the
    /// ledger was left to the new holder.
    ClaimLost { task_id: u64 },
}

impl ExecutionOutcome {
    pub fn task_id(&self) -> u64 {
        match self {
            ExecutionOutcome::Completed { task_id, .. }
            | ExecutionOutcome::StillProcessing { task_id, .. }
            | ExecutionOutcome::Released { task_id }
            | ExecutionOutcome::ClaimLost { task_id } => *task_id,
            ExecutionOutcome::Failed { failure, .. } => failure.task_id,
        }
    }
}

pub struct Orchestrator {
    ledger: Arc<Ledger>,
    adapters: Arc<AdapterLoader>,
    provider: Arc<dyn LanguageModel>,
    prompts: PromptEngine,
    outputs_dir: PathBuf,
    settings: ExecSettings,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<Ledger>,
        adapters: Arc<AdapterLoader>,
        provider: Arc<dyn LanguageModel>,
        outputs_dir: impl Into<PathBuf>,
        settings: ExecSettings,
    ) -> Self {
        Self {
            ledger,
            adapters,
            provider,
            prompts: PromptEngine::new(),
            outputs_dir: outputs_dir.into(),
            settings,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn adapters(&self) -> &AdapterLoader {
        &self.adapters
    }

    pub fn settings(&self) -> &ExecSettings {
        &self.settings
    }

    /// Claim the next task `worker` may take.
    pub async fn claim_next(&self, worker: &WorkerIdentity) -> Result<Option<Task>, LedgerError> {
        let claimant = Claimant::new(worker.token(), worker.is_manager());
        self.with_ledger(move |ledger| ledger.claim_next_task(&claimant))
            .await
    }

    pub async fn reclaim_expired(&self, lease: Duration) -> Result<Vec<FailOutcome>, LedgerError> {
        self.with_ledger(move |ledger| ledger.reclaim_expired(lease))
            .await
    }

    /// Run one attempt of `task`, which `worker` must hold.
    ///
    /// Provider, template and output failures are routed through the retry
    /// policy and reported as [`ExecutionOutcome::Failed`]. A claim lost to
    /// lease expiry ends in [`ExecutionOutcome::ClaimLost`]. Only other ledger
    /// failures surface as `Err`.
    #[instrument(
        skip_all,
        fields(task_id = task.id, task_type = %task.task_type, worker = %worker)
    )]
    pub async fn execute_task(
        &self,
        task: &Task,
        worker: &WorkerIdentity,
        stream_log: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let token = worker.token();
        debug!(phase = Phase::Claimed.as_str(), from = ?task.claimed_from, "attempt started");

        let resolved = self.adapters.resolve(&task.task_type);
        let adapter = resolved.adapter;
        debug!(
            phase = Phase::AdapterResolved.as_str(),
            adapter = %adapter.id,
            strategy = resolved.strategy.as_str(),
            "adapter resolved"
        );

        let stats = self.with_ledger(|ledger| ledger.get_stats()).await?;
        let context = build_context(task, worker, stats, adapter.context());
        let template = if context.attempt.is_continuation {
            &adapter.task_continue
        } else {
            &adapter.task_start
        };
        let instruction = match self.prompts.render(template, &context) {
            Ok(instruction) => instruction,
            Err(err) => {
                return self
                    .fail(task, &token, format!("render instruction: {err}"))
                    .await;
            }
        };
        debug!(
            phase = Phase::ContextBuilt.as_str(),
            continuation = context.attempt.is_continuation,
            chars = instruction.len(),
            "instruction rendered"
        );

        let fit = ContextFit::check(&instruction, self.provider.context_window_tokens());
        if !fit.fits() {
            warn!(
                estimated_tokens = fit.estimated_tokens,
                window_tokens = fit.window_tokens,
                "instruction exceeds the context window; sending anyway"
            );
        }

        let mut options = DispatchOptions::new(cancel.clone());
        if let Some(path) = stream_log {
            match open_stream_log(path, task) {
                Ok(sink) => options = options.with_chunk_sink(sink),
                Err(err) => warn!(path = %path.display(), err = ?err, "stream log unavailable"),
            }
        }
        let dispatch = match self.provider.dispatch(&instruction, options).await {
            Ok(dispatch) => dispatch,
            Err(DispatchError::Cancelled) => return self.release(task, &token).await,
            Err(err) => return self.fail(task, &token, err.to_string()).await,
        };
        info!(
            phase = Phase::Dispatched.as_str(),
            model = %dispatch.model_id,
            duration_ms = dispatch.duration_ms,
            chars = dispatch.text.len(),
            "dispatch returned"
        );
        if dispatch.truncated {
            warn!("provider output was truncated at the output limit");
        }

        let report = evaluate(
            &dispatch.text,
            &adapter.criteria,
            &self.settings.completion_markers,
        );
        debug!(
            phase = Phase::CriteriaEvaluated.as_str(),
            length = report.output_length,
            length_ok = report.length_ok,
            pattern_ok = report.pattern_ok,
            marker = ?report.marker,
            "criteria evaluated"
        );
        if !report.passed() {
            let shortfalls = report.shortfalls(&adapter.criteria);
            return self.still_processing(task, &token, shortfalls).await;
        }

        let location = match self.prompts.render(&adapter.save_as, &context) {
            Ok(location) => location.trim().to_string(),
            Err(err) => {
                return self
                    .fail(task, &token, format!("render output location: {err}"))
                    .await;
            }
        };
        let output_path = match write_output(&self.outputs_dir, &location, &dispatch.text) {
            Ok(path) => path,
            Err(err) => {
                return self
                    .fail(task, &token, format!("persist output: {err:#}"))
                    .await;
            }
        };

        let subtasks = if adapter.decomposes() {
            self.subtasks_for(task, &adapter, &dispatch.text)
        } else {
            Vec::new()
        };

        let id = task.id;
        let worker_id = token.clone();
        let completed = self
            .with_ledger(move |ledger| {
                ledger.complete_task_with_subtasks(id, &worker_id, Some(location), subtasks)
            })
            .await;
        let (_, created) = match completed {
            Ok(completed) => completed,
            Err(err) => return claim_lost(id, err),
        };
        let subtasks: Vec<u64> = created.iter().map(|t| t.id).collect();
        info!(
            phase = Phase::Completed.as_str(),
            output = %output_path.display(),
            subtasks = subtasks.len(),
            "task completed"
        );
        Ok(ExecutionOutcome::Completed {
            task_id: task.id,
            output_path,
            subtasks,
        })
    }

    fn subtasks_for(&self, task: &Task, adapter: &TaskAdapter, output: &str) -> Vec<NewTask> {
        let default_type = adapter.subtask_type.as_deref().unwrap_or(GENERIC_ADAPTER_ID);
        let Some(specs) = subtasks_from_output(output, default_type) else {
            warn!("decomposing task produced no structured list; no subtasks created");
            return Vec::new();
        };
        specs
            .into_iter()
            .map(|spec| self.new_subtask(task.id, spec))
            .collect()
    }

    fn new_subtask(&self, parent_id: u64, spec: SubtaskSpec) -> NewTask {
        let policy = self.adapters.resolve(&spec.task_type).adapter.policy();
        NewTask {
            task_type: spec.task_type,
            title: spec.title,
            description: spec.description,
            params: spec.params,
            parent_task_id: Some(parent_id),
            policy,
        }
    }

    async fn still_processing(
        &self,
        task: &Task,
        worker_id: &str,
        shortfalls: Vec<String>,
    ) -> Result<ExecutionOutcome> {
        let dispatches = task.continuations + 1;
        if dispatches >= self.settings.max_continuations {
            let reason = format!(
                "completion criteria unmet after {dispatches} dispatches: {}",
                shortfalls.join("; ")
            );
            return self.fail(task, worker_id, reason).await;
        }

        let id = task.id;
        let worker = worker_id.to_string();
        let note = shortfalls.join("; ");
        let updated = match self
            .with_ledger(move |ledger| ledger.mark_processing(id, &worker, &note))
            .await
        {
            Ok(updated) => updated,
            Err(err) => return claim_lost(id, err),
        };
        info!(
            phase = Phase::StillProcessing.as_str(),
            continuations = updated.continuations,
            shortfalls = ?shortfalls,
            "completion criteria unmet"
        );
        Ok(ExecutionOutcome::StillProcessing {
            task_id: id,
            continuations: updated.continuations,
            shortfalls,
        })
    }

    async fn fail(&self, task: &Task, worker_id: &str, reason: String) -> Result<ExecutionOutcome> {
        let id = task.id;
        let worker = worker_id.to_string();
        let ledger_reason = reason.clone();
        let outcome = match self
            .with_ledger(move |ledger| ledger.fail_task(id, &worker, &ledger_reason))
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => return claim_lost(id, err),
        };
        let failure = TaskFailure {
            task_id: id,
            status: task
                .claimed_from
                .clone()
                .unwrap_or_else(|| task.status.clone()),
            reason,
        };
        warn!(
            phase = Phase::Failed.as_str(),
            exhausted = outcome.is_exhausted(),
            "{failure}"
        );
        Ok(ExecutionOutcome::Failed {
            failure,
            exhausted: outcome.is_exhausted(),
        })
    }

    async fn release(&self, task: &Task, worker_id: &str) -> Result<ExecutionOutcome> {
        let id = task.id;
        let worker = worker_id.to_string();
        if let Err(err) = self
            .with_ledger(move |ledger| ledger.release_task(id, &worker))
            .await
        {
            return claim_lost(id, err);
        }
        info!(phase = Phase::Released.as_str(), "dispatch cancelled; task released");
        Ok(ExecutionOutcome::Released { task_id: id })
    }

    /// Ledger calls block on file locks, so they run off the async workers.
    async fn with_ledger<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Ledger) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let ledger = Arc::clone(&self.ledger);
        tokio::task::spawn_blocking(move || f(&ledger))
            .await
            .map_err(|err| LedgerError::Storage(anyhow!("ledger task panicked: {err}")))?
    }
}

/// `NotHeld` on an attempt's closing transition means the lease ran out and
/// someone else now owns the task; every other ledger error is fatal.
fn claim_lost(task_id: u64, err: LedgerError) -> Result<ExecutionOutcome> {
    match err {
        LedgerError::NotHeld { holder, .. } => {
            warn!(
                phase = Phase::ClaimLost.as_str(),
                holder = ?holder,
                "claim expired before the attempt finished; result discarded"
            );
            Ok(ExecutionOutcome::ClaimLost { task_id })
        }
        err => Err(err.into()),
    }
}

/// Append-mode sink for dispatch chunks, headed by the attempt it belongs to.
fn open_stream_log(path: &Path, task: &Task) -> Result<ChunkSink> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(
        file,
        "--- task {} ({}) retry {} continuation {} at {} ---",
        task.id,
        task.title,
        task.retry_count,
        task.continuations,
        Utc::now().to_rfc3339()
    )?;
    let mut failed = false;
    Ok(Box::new(move |chunk: &str| {
        if failed {
            return;
        }
        if let Err(err) = file.write_all(chunk.as_bytes()) {
            warn!(err = %err, "stream log write failed; dropping further chunks");
            failed = true;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::decode;
    use crate::test_support::{
        ScriptStep, ScriptedProvider, new_task, policy, workspace, write_adapter,
    };
    use serde_json::json;

    fn orchestrator(
        paths: &crate::io::init::SwarmPaths,
        provider: Arc<ScriptedProvider>,
    ) -> Orchestrator {
        Orchestrator::new(
            Arc::new(Ledger::new(&paths.ledger_path)),
            Arc::new(AdapterLoader::new(&paths.adapters_dir)),
            provider,
            &paths.outputs_dir,
            ExecSettings::default(),
        )
    }

    fn dev() -> WorkerIdentity {
        decode("HIVE_DEV_W0_S1_U00004").expect("token")
    }

    #[tokio::test]
    async fn completed_output_is_written_under_outputs() {
        let (_temp, paths) = workspace();
        let provider = Arc::new(ScriptedProvider::replies(["All done.\nTASK_COMPLETE\n"]));
        let orch = orchestrator(&paths, provider.clone());
        orch.ledger()
            .add_tasks(vec![new_task("Write Notes", policy(3))])
            .expect("add");

        let task = orch.claim_next(&dev()).await.expect("claim").expect("task");
        let outcome = orch
            .execute_task(&task, &dev(), None, &CancellationToken::new())
            .await
            .expect("execute");

        let ExecutionOutcome::Completed { output_path, subtasks, .. } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert!(subtasks.is_empty());
        assert_eq!(output_path, paths.outputs_dir.join("generic").join("1-write-notes.md"));
        assert!(fs::read_to_string(&output_path).expect("output").contains("All done."));
        let stored = orch.ledger().get_task(1).expect("get").expect("task");
        assert_eq!(stored.status, "completed");
        assert_eq!(stored.output_location.as_deref(), Some("generic/1-write-notes.md"));
        assert!(provider.instructions()[0].contains("Task 1: Write Notes"));
    }

    #[tokio::test]
    async fn provider_errors_go_through_the_retry_policy() {
        let (_temp, paths) = workspace();
        let provider = Arc::new(ScriptedProvider::new([ScriptStep::Fail(
            DispatchError::QuotaExceeded("429".to_string()),
        )]));
        let orch = orchestrator(&paths, provider);
        orch.ledger()
            .add_tasks(vec![new_task("t", policy(3))])
            .expect("add");

        let task = orch.claim_next(&dev()).await.expect("claim").expect("task");
        let outcome = orch
            .execute_task(&task, &dev(), None, &CancellationToken::new())
            .await
            .expect("execute");

        let ExecutionOutcome::Failed { failure, exhausted } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(!exhausted);
        assert_eq!(failure.status, "pending");
        assert!(failure.reason.contains("quota"));
        let stored = orch.ledger().get_task(1).expect("get").expect("task");
        assert_eq!(stored.status, "pending");
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn repeated_soft_misses_escalate() {
        let (_temp, paths) = workspace();
        let provider = Arc::new(ScriptedProvider::replies(["no marker", "still none", "nope"]));
        let orch = orchestrator(&paths, provider);
        orch.ledger()
            .add_tasks(vec![new_task("t", policy(0))])
            .expect("add");
        let cancel = CancellationToken::new();

        for expected in 1..=2 {
            let task = orch.claim_next(&dev()).await.expect("claim").expect("task");
            let outcome = orch
                .execute_task(&task, &dev(), None, &cancel)
                .await
                .expect("execute");
            assert!(
                matches!(
                    outcome,
                    ExecutionOutcome::StillProcessing { continuations, .. }
                        if continuations == expected
                ),
                "unexpected {outcome:?}"
            );
        }

        let task = orch.claim_next(&dev()).await.expect("claim").expect("task");
        let outcome = orch
            .execute_task(&task, &dev(), None, &cancel)
            .await
            .expect("execute");
        let ExecutionOutcome::Failed { failure, exhausted } = outcome else {
            panic!("expected escalation, got {outcome:?}");
        };
        assert!(exhausted);
        assert!(failure.reason.starts_with("completion criteria unmet after 3 dispatches"));
    }

    #[tokio::test]
    async fn template_errors_fail_the_attempt() {
        let (_temp, paths) = workspace();
        let mut doc =
            serde_json::to_value(crate::io::adapter::generic_adapter_file()).expect("doc");
        doc["id"] = json!("broken");
        doc["prompts"]["taskStart"] = json!("{{ task.nope.deeper }}");
        write_adapter(&paths.adapters_dir, "broken", &doc);

        let provider = Arc::new(ScriptedProvider::replies(["unused TASK_COMPLETE"]));
        let orch = orchestrator(&paths, provider.clone());
        let mut spec = new_task("t", policy(3));
        spec.task_type = "broken".to_string();
        orch.ledger().add_tasks(vec![spec]).expect("add");

        let task = orch.claim_next(&dev()).await.expect("claim").expect("task");
        let outcome = orch
            .execute_task(&task, &dev(), None, &CancellationToken::new())
            .await
            .expect("execute");
        let ExecutionOutcome::Failed { failure, .. } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(failure.reason.starts_with("render instruction"));
        assert_eq!(provider.remaining(), 1);
    }

    #[tokio::test]
    async fn chunks_are_appended_to_the_stream_log() {
        let (temp, paths) = workspace();
        let provider = Arc::new(ScriptedProvider::replies(["line one\nTASK_COMPLETE\n"]));
        let orch = orchestrator(&paths, provider);
        orch.ledger()
            .add_tasks(vec![new_task("t", policy(3))])
            .expect("add");
        let stream = temp.path().join("worker").join("stream.log");

        let task = orch.claim_next(&dev()).await.expect("claim").expect("task");
        orch.execute_task(&task, &dev(), Some(&stream), &CancellationToken::new())
            .await
            .expect("execute");

        let log = fs::read_to_string(&stream).expect("stream log");
        assert!(log.starts_with("--- task 1 (t)"));
        assert!(log.ends_with("line one\nTASK_COMPLETE\n"));
    }

    #[tokio::test]
    async fn reclaimed_claim_discards_the_late_result() {
        let (_temp, paths) = workspace();
        let provider = Arc::new(ScriptedProvider::replies([
            "late TASK_COMPLETE",
            "on time TASK_COMPLETE",
        ]));
        let orch = orchestrator(&paths, provider);
        orch.ledger()
            .add_tasks(vec![new_task("t", policy(3))])
            .expect("add");
        let qa = decode("HIVE_QA_W0_S1_U00005").expect("token");

        let stale = orch.claim_next(&dev()).await.expect("claim").expect("task");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reclaimed = orch
            .reclaim_expired(Duration::from_millis(1))
            .await
            .expect("reclaim");
        assert_eq!(reclaimed.len(), 1);
        let fresh = orch.claim_next(&qa).await.expect("claim").expect("task");

        let outcome = orch
            .execute_task(&stale, &dev(), None, &CancellationToken::new())
            .await
            .expect("lost claim is not fatal");
        assert_eq!(outcome, ExecutionOutcome::ClaimLost { task_id: 1 });
        let stored = orch.ledger().get_task(1).expect("get").expect("task");
        assert_eq!(stored.status, "in_progress");
        assert_eq!(stored.owner, Some(qa.token()));

        let outcome = orch
            .execute_task(&fresh, &qa, None, &CancellationToken::new())
            .await
            .expect("execute");
        assert!(matches!(outcome, ExecutionOutcome::Completed { .. }), "{outcome:?}");
    }

    #[tokio::test]
    async fn oversized_instruction_is_still_dispatched() {
        let (_temp, paths) = workspace();
        let provider = Arc::new(
            ScriptedProvider::replies(["fine TASK_COMPLETE"]).with_context_window(1),
        );
        let orch = orchestrator(&paths, provider.clone());
        orch.ledger()
            .add_tasks(vec![new_task("big", policy(3))])
            .expect("add");

        let task = orch.claim_next(&dev()).await.expect("claim").expect("task");
        let outcome = orch
            .execute_task(&task, &dev(), None, &CancellationToken::new())
            .await
            .expect("execute");

        assert!(matches!(outcome, ExecutionOutcome::Completed { .. }), "{outcome:?}");
        let sent = provider.instructions();
        assert_eq!(sent.len(), 1);
        assert!(!ContextFit::check(&sent[0], 1).fits());
    }
}
