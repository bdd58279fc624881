//! Child process execution with a timeout, bounded output, line streaming and
//! cooperative cancellation.

use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Limits and hooks for one run.
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: &'a CancellationToken,
    /// Called with each stdout line (including its newline) as it arrives.
    pub on_line: Option<&'a mut (dyn FnMut(&str) + Send)>,
}

/// Run `cmd`, streaming stdout lines to `on_line` while the child runs.
///
/// The child is killed on timeout or when `cancel` fires; the returned output
/// records which. Bytes beyond `output_limit_bytes` are drained and counted
/// but not kept.
#[instrument(
    skip_all,
    fields(
        timeout_secs = options.timeout.as_secs(),
        output_limit_bytes = options.output_limit_bytes
    )
)]
pub fn run_command_streaming(mut cmd: Command, options: RunOptions<'_>) -> Result<CommandOutput> {
    let RunOptions {
        stdin,
        timeout,
        output_limit_bytes,
        cancel,
        mut on_line,
    } = options;

    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = input.to_vec();
        // Written from a thread so a child that never reads stdin cannot block us.
        thread::spawn(move || {
            if let Err(e) = child_stdin.write_all(&input) {
                warn!(err = %e, "failed to write child stdin");
            }
        });
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let (line_tx, line_rx) = mpsc::channel::<String>();
    let stdout_handle =
        thread::spawn(move || read_lines_limited(stdout, output_limit_bytes, line_tx));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        forward_lines(&line_rx, &mut on_line);
        if let Some(status) = child.wait_timeout(POLL_INTERVAL).context("wait for command")? {
            break Some(status);
        }
        if cancel.is_cancelled() {
            debug!("cancellation requested, killing child");
            cancelled = true;
        } else if started.elapsed() >= timeout {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            timed_out = true;
        } else {
            continue;
        }
        child.kill().context("kill command")?;
        child.wait().context("wait command after kill")?;
        break None;
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    forward_lines(&line_rx, &mut on_line);

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.and_then(|s| s.code()), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn forward_lines(rx: &mpsc::Receiver<String>, on_line: &mut Option<&mut (dyn FnMut(&str) + Send)>) {
    while let Ok(line) = rx.try_recv() {
        if let Some(sink) = on_line.as_mut() {
            sink(&line);
        }
    }
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read stdout line by line, forwarding each line and keeping up to `limit` bytes.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    lines: mpsc::Sender<String>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        // The receiver may already be gone after a kill; keep draining regardless.
        let _ = lines.send(String::from_utf8_lossy(&line).into_owned());

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
