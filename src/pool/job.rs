use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};

use crate::affinity::AffinityMap;
use crate::error::{PoolError, Result};
use crate::pool::task::TaskRef;

/// Poll period while waiting out the termination grace.
const KILL_POLL: Duration = Duration::from_millis(50);

/// What to do with a job whose wall-clock timeout expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutAction {
    /// Kill the job; it finishes with a non-zero `rcode` and no `on_done`.
    Terminate,
    /// Kill and re-spawn the job in place with identical arguments.
    Restart,
}

/// Job weight used for chained eviction ordering and vmem prediction.
///
/// `Unknown` excludes the job from chaining so unknown weights are never
/// compared against known ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSize {
    Unknown,
    Known(u64),
}

impl JobSize {
    pub fn known(self) -> Option<u64> {
        match self {
            JobSize::Unknown => None,
            JobSize::Known(n) => Some(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Unsubmitted,
    Waiting,
    Active,
    FinishedOk,
    FinishedFail,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Unsubmitted => write!(f, "unsubmitted"),
            JobState::Waiting => write!(f, "waiting"),
            JobState::Active => write!(f, "active"),
            JobState::FinishedOk => write!(f, "finished"),
            JobState::FinishedFail => write!(f, "failed"),
        }
    }
}

/// Destination of a child output stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdioTarget {
    /// Inherit the supervisor's handle.
    #[default]
    Inherit,
    /// Discard.
    Null,
    /// Append-or-create the given file; re-opened in append mode across
    /// restarts so prior output is preserved.
    File(PathBuf),
    /// Merge stderr into whatever stdout resolves to. Only valid for stderr.
    ToStdout,
}

/// Caller-supplied lifecycle callbacks.
///
/// Both hooks run on the supervisor thread and must not block; a stalled
/// hook stalls the whole pool. The default implementations are no-ops.
pub trait JobHooks: Send {
    fn on_start(&mut self, _job: &Job) {}
    /// Fires at most once, and only when the final attempt exits with 0.
    fn on_done(&mut self, _job: &Job) {}
}

/// No-op hook set.
pub struct NoHooks;

impl JobHooks for NoHooks {}

/// One external process with resource constraints and lifecycle hooks.
pub struct Job {
    pub name: String,
    /// Command line; empty makes this a stub job that only runs callbacks.
    pub argv: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Wall-clock bound per attempt; zero means unbounded.
    pub timeout: Duration,
    pub on_timeout: TimeoutAction,
    /// Supervisor-side sleep right after spawn.
    pub start_delay: Duration,
    pub task: Option<TaskRef>,
    /// Chaining tag; required for chained eviction together with a known size.
    pub category: Option<String>,
    pub size: JobSize,
    /// Expected runtime multiplier vs. baseline.
    pub slowdown: f64,
    pub stdout: StdioTarget,
    pub stderr: StdioTarget,
    /// Skip CPU pinning, e.g. for multi-threaded workers.
    pub omit_affinity: bool,
    pub(crate) hooks: Option<Box<dyn JobHooks>>,

    // Runtime fields, owned by the pool.
    pub(crate) state: JobState,
    pub(crate) child: Option<Child>,
    pub pid: Option<u32>,
    pub worker_slot: Option<usize>,
    /// First attempt start.
    pub tstart: Option<DateTime<Utc>>,
    /// Final exit.
    pub tstop: Option<DateTime<Utc>>,
    /// Monotonic clock of the current attempt, drives the timeout.
    pub(crate) attempt_start: Option<Instant>,
    /// Smoothed high-water mark of the process tree footprint in bytes.
    pub vmem_smooth: u64,
    /// Exit code of the last attempt; negative signal number when killed.
    pub rcode: Option<i32>,
    pub num_terminations: u32,
}

impl Job {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
            workdir: None,
            timeout: Duration::ZERO,
            on_timeout: TimeoutAction::Terminate,
            start_delay: Duration::ZERO,
            task: None,
            category: None,
            size: JobSize::Unknown,
            slowdown: 1.0,
            stdout: StdioTarget::Inherit,
            stderr: StdioTarget::Inherit,
            omit_affinity: false,
            hooks: None,
            state: JobState::Unsubmitted,
            child: None,
            pid: None,
            worker_slot: None,
            tstart: None,
            tstop: None,
            attempt_start: None,
            vmem_smooth: 0,
            rcode: None,
            num_terminations: 0,
        }
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration, action: TimeoutAction) -> Self {
        self.timeout = timeout;
        self.on_timeout = action;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_task(mut self, task: TaskRef) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_category(mut self, category: impl Into<String>, size: JobSize) -> Self {
        self.category = Some(category.into());
        self.size = size;
        self
    }

    pub fn with_slowdown(mut self, slowdown: f64) -> Self {
        self.slowdown = slowdown;
        self
    }

    pub fn with_stdout(mut self, target: StdioTarget) -> Self {
        self.stdout = target;
        self
    }

    pub fn with_stderr(mut self, target: StdioTarget) -> Self {
        self.stderr = target;
        self
    }

    pub fn with_hooks(mut self, hooks: impl JobHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    pub fn omit_affinity(mut self) -> Self {
        self.omit_affinity = true;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// True when this job participates in chained eviction.
    pub(crate) fn chain_key(&self) -> Option<(&str, u64)> {
        match (&self.category, self.size.known()) {
            (Some(cat), Some(size)) if size > 0 => Some((cat.as_str(), size)),
            _ => None,
        }
    }

    /// Task name for reporting.
    pub async fn task_name(&self) -> Option<String> {
        match &self.task {
            Some(task) => Some(task.lock().await.name.clone()),
            None => None,
        }
    }

    /// Spawn the child, pin it and record the attempt start.
    ///
    /// Stdio files are created on the first attempt and re-opened in append
    /// mode on every later one.
    pub(crate) fn spawn(&mut self, slot: usize, affinity: &AffinityMap) -> Result<()> {
        let append = self.num_terminations > 0;
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        let merge_stderr = self.stderr == StdioTarget::ToStdout;
        let (stdout, stderr) = match (&self.stdout, merge_stderr) {
            // Both streams share one file description so writes interleave.
            (StdioTarget::File(path), true) => {
                let file = self.open_file(path, append)?;
                let clone = file.try_clone().map_err(|e| PoolError::StdioFailed {
                    job: self.name.clone(),
                    source: e,
                })?;
                (Stdio::from(file), Stdio::from(clone))
            }
            (_, true) => (
                self.open_target(&self.stdout, append)?,
                self.open_target(&self.stdout, append)?,
            ),
            (_, false) => (
                self.open_target(&self.stdout, append)?,
                self.open_target(&self.stderr, append)?,
            ),
        };
        cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);
        cmd.kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| PoolError::SpawnFailed {
            job: self.name.clone(),
            source: e,
        })?;
        let pid = child.id();

        if !self.omit_affinity && affinity.is_enabled() {
            if let Some(pid) = pid {
                if let Err(err) = affinity.pin(pid, slot) {
                    tracing::warn!(job = %self.name, slot, error = %err, "CPU pinning failed");
                }
            }
        }

        self.child = Some(child);
        self.pid = pid;
        self.worker_slot = Some(slot);
        if self.tstart.is_none() {
            self.tstart = Some(Utc::now());
        }
        self.attempt_start = Some(Instant::now());
        self.rcode = None;
        self.state = JobState::Active;
        tracing::info!(job = %self.name, pid = ?self.pid, slot, "Job started");
        Ok(())
    }

    fn open_target(&self, target: &StdioTarget, append: bool) -> Result<Stdio> {
        match target {
            StdioTarget::Inherit => Ok(Stdio::inherit()),
            StdioTarget::Null => Ok(Stdio::null()),
            StdioTarget::File(path) => Ok(Stdio::from(self.open_file(path, append)?)),
            // Resolved against the stdout target by the caller.
            StdioTarget::ToStdout => Ok(Stdio::inherit()),
        }
    }

    fn open_file(&self, path: &std::path::Path, append: bool) -> Result<std::fs::File> {
        let mut opts = OpenOptions::new();
        opts.create(true).write(true);
        if append {
            opts.append(true);
        } else {
            opts.truncate(true);
        }
        opts.open(path).map_err(|e| PoolError::StdioFailed {
            job: self.name.clone(),
            source: e,
        })
    }

    /// Non-blocking exit check; `Some(rcode)` once the child has exited.
    pub(crate) fn poll(&mut self) -> Option<i32> {
        let status = match self.child.as_mut()?.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(err) => {
                tracing::warn!(job = %self.name, error = %err, "Polling the child failed");
                return None;
            }
        };
        self.child = None;
        self.pid = None;
        Some(exit_code(status))
    }

    /// Block until the child exits; inline (synchronous) execution only.
    pub(crate) async fn wait(&mut self) -> i32 {
        let Some(mut child) = self.child.take() else {
            return 0;
        };
        self.pid = None;
        match child.wait().await {
            Ok(status) => exit_code(status),
            Err(err) => {
                tracing::warn!(job = %self.name, error = %err, "Waiting for the child failed");
                -1
            }
        }
    }

    /// Elapsed wall clock of the current attempt.
    pub(crate) fn attempt_elapsed(&self) -> Duration {
        self.attempt_start
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Kill the current attempt and re-spawn in place with identical
    /// arguments. Timeout recovery only, never memory eviction; the
    /// termination bumps `num_terminations` and the re-spawn re-opens
    /// stdio files in append mode.
    pub(crate) async fn restart(
        &mut self,
        slot: usize,
        affinity: &AffinityMap,
        grace: Duration,
    ) -> Result<()> {
        self.terminate(grace).await;
        self.spawn(slot, affinity)?;
        self.run_on_start();
        Ok(())
    }

    /// SIGTERM, bounded grace, then SIGKILL. Records `rcode` and counts the
    /// termination. Idempotent once the child is gone.
    pub(crate) async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Some(pid) = self.pid {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        let mut status = None;
        loop {
            match child.try_wait() {
                Ok(Some(st)) => {
                    status = Some(st);
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    tokio::time::sleep(KILL_POLL).await;
                }
                _ => break,
            }
        }
        let status = match status {
            Some(st) => Some(st),
            None => {
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        };
        self.rcode = status.map(exit_code);
        self.num_terminations += 1;
        self.pid = None;
        tracing::info!(
            job = %self.name,
            rcode = ?self.rcode,
            terminations = self.num_terminations,
            "Job terminated"
        );
    }

    pub(crate) fn run_on_start(&mut self) {
        if let Some(mut hooks) = self.hooks.take() {
            let view: &Job = self;
            if catch_unwind(AssertUnwindSafe(|| hooks.on_start(view))).is_err() {
                tracing::error!(job = %self.name, "on_start hook panicked");
            }
            self.hooks = Some(hooks);
        }
    }

    pub(crate) fn run_on_done(&mut self) {
        if let Some(mut hooks) = self.hooks.take() {
            let view: &Job = self;
            if catch_unwind(AssertUnwindSafe(|| hooks.on_done(view))).is_err() {
                tracing::error!(job = %self.name, "on_done hook panicked");
            }
            self.hooks = Some(hooks);
        }
    }
}

/// Exit code of a reaped child; negative signal number when killed.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}
