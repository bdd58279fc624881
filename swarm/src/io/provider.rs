//! Language-model provider abstraction.
//!
//! The [`LanguageModel`] trait decouples the orchestrator from the actual
//! model backend. [`CommandProvider`] shells out to a configured CLI; tests use
//! scripted providers from `test_support` that never spawn processes.

use std::process::Command;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::DispatchError;
use crate::io::config::{ProviderConfig, SwarmConfig};
use crate::io::process::{CommandOutput, RunOptions, run_command_streaming};

/// Receives reply text incrementally while a dispatch runs.
pub type ChunkSink = Box<dyn FnMut(&str) + Send>;

/// Per-dispatch hooks.
pub struct DispatchOptions {
    pub cancel: CancellationToken,
    pub on_chunk: Option<ChunkSink>,
}

impl DispatchOptions {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            on_chunk: None,
        }
    }

    pub fn with_chunk_sink(mut self, sink: ChunkSink) -> Self {
        self.on_chunk = Some(sink);
        self
    }
}

/// A finished reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub text: String,
    /// The reply exceeded the output limit and was cut.
    pub truncated: bool,
    pub model_id: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_id(&self) -> &str;

    /// Context window used for the pre-dispatch fit check.
    fn context_window_tokens(&self) -> usize;

    /// Send `instruction` and wait for the full reply.
    ///
    /// Must return [`DispatchError::Cancelled`] promptly once
    /// `options.cancel` fires.
    async fn dispatch(
        &self,
        instruction: &str,
        options: DispatchOptions,
    ) -> Result<Dispatch, DispatchError>;
}

/// Provider that pipes the instruction into a model CLI and reads stdout.
#[derive(Debug, Clone)]
pub struct CommandProvider {
    program: String,
    args: Vec<String>,
    model: String,
    timeout: Duration,
    output_limit_bytes: usize,
    context_window_tokens: usize,
}

impl CommandProvider {
    pub fn new(
        provider: &ProviderConfig,
        timeout: Duration,
        output_limit_bytes: usize,
        context_window_tokens: usize,
    ) -> Self {
        let mut parts = provider
            .command
            .iter()
            .map(|arg| arg.replace("{model}", &provider.model));
        Self {
            program: parts.next().unwrap_or_default(),
            args: parts.collect(),
            model: provider.model.clone(),
            timeout,
            output_limit_bytes,
            context_window_tokens,
        }
    }

    pub fn from_config(cfg: &SwarmConfig) -> Self {
        Self::new(
            &cfg.provider,
            cfg.dispatch_timeout(),
            cfg.output_limit_bytes,
            cfg.context_window_tokens,
        )
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

#[async_trait]
impl LanguageModel for CommandProvider {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn context_window_tokens(&self) -> usize {
        self.context_window_tokens
    }

    #[instrument(skip_all, fields(program = %self.program, model = %self.model))]
    async fn dispatch(
        &self,
        instruction: &str,
        options: DispatchOptions,
    ) -> Result<Dispatch, DispatchError> {
        info!(chars = instruction.len(), "dispatching");
        let started = Instant::now();
        let cmd = self.command();
        let input = instruction.as_bytes().to_vec();
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;
        let DispatchOptions {
            cancel,
            mut on_chunk,
        } = options;

        let output = tokio::task::spawn_blocking(move || {
            run_command_streaming(
                cmd,
                RunOptions {
                    stdin: Some(&input),
                    timeout,
                    output_limit_bytes: limit,
                    cancel: &cancel,
                    on_line: on_chunk
                        .as_mut()
                        .map(|sink| sink.as_mut() as &mut (dyn FnMut(&str) + Send)),
                },
            )
        })
        .await
        .map_err(|err| DispatchError::Failed(format!("provider task panicked: {err}")))?
        .map_err(|err| DispatchError::Failed(format!("{err:#}")))?;

        let duration_ms = started.elapsed().as_millis() as u64;
        if output.cancelled {
            return Err(DispatchError::Cancelled);
        }
        if output.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "provider timed out");
            return Err(DispatchError::TimedOut(timeout));
        }
        if !output.success() {
            let err = classify_failure(&output);
            warn!(err = %err, "provider failed");
            return Err(err);
        }

        debug!(duration_ms, truncated = output.stdout_truncated > 0, "dispatch finished");
        Ok(Dispatch {
            text: output.stdout_lossy(),
            truncated: output.stdout_truncated > 0,
            model_id: self.model.clone(),
            duration_ms,
        })
    }
}

/// Map a failed provider run onto a [`DispatchError`] kind using its stderr.
pub fn classify_failure(output: &CommandOutput) -> DispatchError {
    let stderr = output.stderr_lossy();
    let detail = stderr
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .unwrap_or("no stderr")
        .to_string();
    let lower = stderr.to_lowercase();

    if ["permission denied", "unauthorized", "forbidden", "invalid api key"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        DispatchError::PermissionDenied(detail)
    } else if ["model not found", "unknown model", "no such model"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        DispatchError::ModelNotFound(detail)
    } else if ["quota", "rate limit", "too many requests", "blocked"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        DispatchError::QuotaExceeded(detail)
    } else {
        let code = output
            .status
            .and_then(|status| status.code())
            .map_or_else(|| "signal".to_string(), |code| code.to_string());
        DispatchError::Failed(format!("exit {code}: {detail}"))
    }
}
