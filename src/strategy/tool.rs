//! External-tool strategy: wget/curl processes with progress parsed from stderr

use super::{TempFileGuard, TransferJob};
use crate::catalog::{ToolCandidate, ToolKind};
use crate::config::ToolPaths;
use crate::events::DownloadEvent;
use crate::progress::{MIN_REPORT_ELAPSED, ProgressTracker, estimate_rate, parse_percent};
use crate::retry::AttemptError;
use crate::validate::has_shell_metachars;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{Instant, MissedTickBehavior};

// ============================================================================
// Trait Definitions
// ============================================================================

/// What to run for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub method: ToolKind,
    pub program: String,
    pub args: Vec<String>,
    /// Scratch file the tool writes to
    pub output: PathBuf,
}

/// Exit status of a downloader process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// A running downloader process owned by exactly one attempt
#[async_trait]
pub trait ToolProcess: Send {
    /// Next non-empty output segment, or `None` once output is closed
    ///
    /// Must be cancel-safe: dropping the future loses no output.
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;

    /// Wait for the process to exit; cancel-safe
    async fn wait(&mut self) -> std::io::Result<ProcessExit>;

    /// Stop the process and reap it; no-op if it already exited
    async fn terminate(&mut self);
}

/// Starts downloader processes
#[async_trait]
pub trait ToolLauncher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ToolProcess>>;
}

// ============================================================================
// Command Construction
// ============================================================================

/// Arguments for a resumable, self-retrying transfer of `url` into `output`
///
/// URLs carrying shell metacharacters are refused outright even though no
/// shell is involved.
pub fn build_args(method: ToolKind, url: &str, output: &Path) -> Result<Vec<String>, AttemptError> {
    if has_shell_metachars(url) {
        return Err(AttemptError::Skipped(format!(
            "URL contains prohibited characters for {method}"
        )));
    }

    let output = output.to_string_lossy();
    let output: &str = &output;
    let args: Vec<&str> = match method {
        ToolKind::Wget => vec![
            "-4",
            "-c",
            "--https-only",
            "--progress=dot:giga",
            "--timeout=30",
            "--tries=3",
            "--read-timeout=60",
            "-O",
            output,
            url,
        ],
        ToolKind::Curl => vec![
            "-4",
            "-L",
            "--fail",
            "--proto",
            "=https",
            "--proto-redir",
            "=https",
            "-C",
            "-",
            "--connect-timeout",
            "30",
            "--speed-time",
            "60",
            "--speed-limit",
            "1024",
            "--retry",
            "3",
            "--progress-bar",
            "-o",
            output,
            url,
        ],
    };

    Ok(args.into_iter().map(String::from).collect())
}

// ============================================================================
// Production Implementation
// ============================================================================

/// Longest output segment kept before it is flushed without a delimiter
const MAX_SEGMENT: usize = 64 * 1024;

/// Splits a byte stream on `\n` and `\r` (curl redraws its bar with `\r`)
struct SegmentReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> SegmentReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::new(),
            eof: false,
        }
    }

    fn take_pending(&mut self) -> String {
        let bytes = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    async fn next_segment(&mut self) -> std::io::Result<Option<String>> {
        loop {
            if self.eof {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let segment = self.take_pending();
                if segment.trim().is_empty() {
                    continue;
                }
                return Ok(Some(segment));
            }

            let buf = self.inner.fill_buf().await?;
            if buf.is_empty() {
                self.eof = true;
                continue;
            }

            if let Some(pos) = buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                self.pending.extend_from_slice(&buf[..pos]);
                self.inner.consume(pos + 1);
                let segment = self.take_pending();
                if segment.trim().is_empty() {
                    continue;
                }
                return Ok(Some(segment));
            }

            let len = buf.len();
            self.pending.extend_from_slice(buf);
            self.inner.consume(len);

            if self.pending.len() >= MAX_SEGMENT {
                return Ok(Some(self.take_pending()));
            }
        }
    }
}

/// Production launcher using tokio::process
pub struct SystemToolLauncher {
    stop_timeout: Duration,
}

impl SystemToolLauncher {
    pub fn new(stop_timeout: Duration) -> Self {
        Self { stop_timeout }
    }
}

impl Default for SystemToolLauncher {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl ToolLauncher for SystemToolLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ToolProcess>> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", spec.program))?;

        let stderr = child
            .stderr
            .take()
            .context("Failed to capture downloader stderr")?;

        tracing::info!(
            method = %spec.method,
            program = %spec.program,
            pid = ?child.id(),
            output = ?spec.output,
            "Downloader process spawned"
        );

        Ok(Box::new(SystemToolProcess {
            child,
            reader: SegmentReader::new(stderr),
            stop_timeout: self.stop_timeout,
        }))
    }
}

struct SystemToolProcess {
    child: Child,
    reader: SegmentReader<ChildStderr>,
    stop_timeout: Duration,
}

#[async_trait]
impl ToolProcess for SystemToolProcess {
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.reader.next_segment().await
    }

    async fn wait(&mut self) -> std::io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(ProcessExit {
            code: status.code(),
        })
    }

    async fn terminate(&mut self) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }

        // Try graceful shutdown first (SIGTERM)
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGTERM);

            tokio::select! {
                _ = self.child.wait() => {
                    tracing::debug!("Downloader stopped gracefully");
                    return;
                }
                () = tokio::time::sleep(self.stop_timeout) => {
                    tracing::warn!("Downloader ignored SIGTERM, sending SIGKILL");
                }
            }
        }

        let _ = self.child.kill().await;
    }
}

// ============================================================================
// Attempt Loop
// ============================================================================

/// Drives one downloader process per attempt
#[derive(Clone)]
pub struct ExternalToolStrategy {
    launcher: Arc<dyn ToolLauncher>,
    tools: ToolPaths,
    poll_interval: Duration,
}

impl ExternalToolStrategy {
    pub fn new(launcher: Arc<dyn ToolLauncher>, tools: ToolPaths, poll_interval: Duration) -> Self {
        Self {
            launcher,
            tools,
            poll_interval,
        }
    }

    fn program(&self, method: ToolKind) -> &str {
        match method {
            ToolKind::Wget => &self.tools.wget,
            ToolKind::Curl => &self.tools.curl,
        }
    }

    /// Run one attempt of `candidate`; on success the final file is in place
    ///
    /// Whatever the outcome, the process is stopped and the scratch file is
    /// either renamed onto the final path or removed before this returns.
    pub async fn attempt(
        &self,
        job: &TransferJob<'_>,
        candidate: &ToolCandidate,
    ) -> Result<(), AttemptError> {
        let method = candidate.method;
        let spec = LaunchSpec {
            method,
            program: self.program(method).to_string(),
            args: build_args(method, &candidate.url, job.temp_file)?,
            output: job.temp_file.to_path_buf(),
        };

        // Never resume from a scratch file left by an earlier attempt
        let _ = tokio::fs::remove_file(job.temp_file).await;
        let temp = TempFileGuard::new(job.temp_file);

        let mut process = self
            .launcher
            .launch(&spec)
            .await
            .map_err(|e| AttemptError::Unreachable(format!("{e:#}")))?;

        let exit = match self.drive(job, method, process.as_mut()).await {
            Ok(exit) => exit,
            Err(e) => {
                process.terminate().await;
                return Err(e);
            }
        };

        if !exit.success() {
            return Err(AttemptError::Unreachable(format!("{method} failed: {exit}")));
        }

        if !tokio::fs::try_exists(temp.path()).await.unwrap_or(false) {
            return Err(AttemptError::Unreachable(format!(
                "{method} exited cleanly but wrote no file"
            )));
        }

        temp.commit(job.final_file)
            .await
            .map_err(|e| AttemptError::Unreachable(format!("failed to move download into place: {e}")))
    }

    /// Poll the process until it exits, the session is cancelled, or progress stalls
    async fn drive(
        &self,
        job: &TransferJob<'_>,
        method: ToolKind,
        process: &mut dyn ToolProcess,
    ) -> Result<ProcessExit, AttemptError> {
        let cancel = job.session.cancel_token();
        let mut tracker = ProgressTracker::new(job.session.stall_timeout());
        let started = Instant::now();

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Phase 1: consume output until the process closes it
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AttemptError::Cancelled),
                _ = ticker.tick() => {
                    if tracker.is_stalled() {
                        return Err(self.stalled(job, method, &tracker));
                    }
                }
                line = process.next_line() => match line {
                    Ok(Some(line)) => self.observe(job, method, &line, &mut tracker, started),
                    Ok(None) => break,
                    Err(e) => {
                        return Err(AttemptError::Unreachable(format!(
                            "failed to read {method} output: {e}"
                        )));
                    }
                },
            }
        }

        // Phase 2: output closed, wait for the exit status
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(AttemptError::Cancelled),
                exit = process.wait() => {
                    return exit.map_err(|e| {
                        AttemptError::Unreachable(format!("failed to wait for {method}: {e}"))
                    });
                }
                _ = ticker.tick() => {
                    if tracker.is_stalled() {
                        return Err(self.stalled(job, method, &tracker));
                    }
                }
            }
        }
    }

    fn stalled(&self, job: &TransferJob<'_>, method: ToolKind, tracker: &ProgressTracker) -> AttemptError {
        tracing::warn!(
            artifact = %job.artifact.id,
            method = %method,
            last_percent = ?tracker.last_percent(),
            stall_timeout_secs = tracker.stall_timeout().as_secs(),
            "Download stalled"
        );
        AttemptError::Stalled(tracker.stall_timeout())
    }

    fn observe(
        &self,
        job: &TransferJob<'_>,
        method: ToolKind,
        line: &str,
        tracker: &mut ProgressTracker,
        started: Instant,
    ) {
        let Some(percent) = parse_percent(line) else {
            tracing::trace!(method = %method, line = %line, "Downloader output");
            return;
        };

        if !tracker.update(percent) {
            return;
        }

        let elapsed = started.elapsed();
        // Reported percent never goes backwards within one invocation
        if elapsed < MIN_REPORT_ELAPSED || percent < job.session.progress() {
            return;
        }

        job.session.record_progress(percent);
        let rate = estimate_rate(percent, job.artifact.size_gb, elapsed);

        job.events.emit_progress(DownloadEvent::Progress {
            progress: percent,
            speed_mbps: rate.speed_mbps,
            eta_seconds: rate.eta_seconds,
            method: method.to_string(),
            elapsed_secs: job.session.elapsed().as_secs_f64(),
        });
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================
