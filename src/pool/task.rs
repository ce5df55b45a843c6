use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::pool::job::StdioTarget;

/// Caller-supplied task lifecycle callbacks; supervisor-thread, non-blocking.
pub trait TaskHooks: Send {
    fn on_start(&mut self, _task: &Task) {}
    fn on_done(&mut self, _task: &Task) {}
}

/// Shared lookup reference: the caller keeps its own clone, jobs carry
/// another. Nobody owns the task through this reference.
pub type TaskRef = Arc<Mutex<Task>>;

/// Named aggregate of jobs sharing lifecycle and completion callbacks.
///
/// Started implicitly when the first attached job enters the active set;
/// complete once every job ever attached is either done or terminated.
pub struct Task {
    pub name: String,
    /// Wall-clock bound from the task start; zero means unbounded.
    pub timeout: Duration,
    /// Default stdio targets for attached jobs that leave theirs inherited.
    pub stdout: StdioTarget,
    pub stderr: StdioTarget,
    pub tstart: Option<DateTime<Utc>>,
    pub tstop: Option<DateTime<Utc>>,
    /// Jobs ever attached.
    pub num_added: u32,
    /// Jobs finished with exit code 0.
    pub num_done: u32,
    /// Jobs terminated or failed.
    pub num_term: u32,
    hooks: Option<Box<dyn TaskHooks>>,
}

impl Task {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: Duration::ZERO,
            stdout: StdioTarget::Inherit,
            stderr: StdioTarget::Inherit,
            tstart: None,
            tstop: None,
            num_added: 0,
            num_done: 0,
            num_term: 0,
            hooks: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

    pub fn with_hooks(mut self, hooks: impl TaskHooks + 'static) -> Self {
        self.hooks = Some(Box::new(hooks));
        self
    }

    pub fn into_ref(self) -> TaskRef {
        Arc::new(Mutex::new(self))
    }

    pub fn is_complete(&self) -> bool {
        self.num_added > 0 && self.num_done + self.num_term == self.num_added
    }

    pub fn has_failures(&self) -> bool {
        self.num_term > 0
    }

    /// First attached job entered the active set.
    pub(crate) fn mark_started(&mut self) {
        if self.tstart.is_some() {
            return;
        }
        self.tstart = Some(Utc::now());
        tracing::info!(task = %self.name, "Task started");
        self.run_on_start();
    }

    pub(crate) fn job_done(&mut self) {
        self.num_done += 1;
    }

    pub(crate) fn job_terminated(&mut self) {
        self.num_term += 1;
    }

    /// Close the task once its counters balance; fires `on_done` once.
    pub(crate) fn try_finish(&mut self) {
        if self.tstop.is_some() || !self.is_complete() {
            return;
        }
        self.tstop = Some(Utc::now());
        tracing::info!(
            task = %self.name,
            done = self.num_done,
            terminated = self.num_term,
            "Task complete"
        );
        self.run_on_done();
    }

    fn run_on_start(&mut self) {
        if let Some(mut hooks) = self.hooks.take() {
            let view: &Task = self;
            if catch_unwind(AssertUnwindSafe(|| hooks.on_start(view))).is_err() {
                tracing::error!(task = %self.name, "on_start hook panicked");
            }
            self.hooks = Some(hooks);
        }
    }

    fn run_on_done(&mut self) {
        if let Some(mut hooks) = self.hooks.take() {
            let view: &Task = self;
            if catch_unwind(AssertUnwindSafe(|| hooks.on_done(view))).is_err() {
                tracing::error!(task = %self.name, "on_done hook panicked");
            }
            self.hooks = Some(hooks);
        }
    }
}
