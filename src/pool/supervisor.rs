use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::affinity::AffinityMap;
use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::pool::job::{Job, JobState, StdioTarget, TimeoutAction};
use crate::pool::task::TaskRef;
use crate::probe::{self, MemoryProbe};
use crate::snapshot::{PoolSnapshot, SnapshotEntry, SnapshotHandle};

/// Scheduler and supervisor over a bounded set of worker slots.
///
/// Single-threaded and cooperative: the supervisor owns every mutation of
/// the waiting queue, the active set and the task counters. Jobs run as OS
/// child processes; hooks run inline on the supervisor thread.
pub struct ExecPool {
    affinity: AffinityMap,
    probe: MemoryProbe,
    /// Memory ceiling in bytes over all active jobs; 0 = unlimited.
    vm_limit: u64,
    latency: Duration,
    grace: Duration,
    chained: bool,
    /// Configured slot count.
    wks_num: usize,
    /// Effective slot count, shrunk under recurring memory pressure.
    cur_wks: usize,
    waiting: VecDeque<Job>,
    /// Active jobs indexed by worker slot.
    active: Vec<Option<Job>>,
    finished: Vec<Job>,
    tasks: Vec<TaskRef>,
    /// Names ever submitted in this pool lifetime.
    names: HashSet<String>,
    /// Per category: completed size -> peak observed vmem, for admission
    /// prediction.
    category_peak: HashMap<String, BTreeMap<u64, u64>>,
    snapshot: SnapshotHandle,
    cancel: Option<CancellationToken>,
    alive: bool,
    pub tstart: DateTime<Utc>,
}

impl ExecPool {
    pub fn new(cfg: PoolConfig) -> Result<Self> {
        cfg.validate()?;
        let probe = MemoryProbe::new();
        let mut vm_limit = cfg.vm_limit_bytes();
        if vm_limit > 0 && !probe.is_available() {
            // Degraded to unlimited mode; the probe warned already.
            vm_limit = 0;
        }
        let latency = cfg.effective_latency();
        tracing::info!(
            workers = cfg.workers,
            vm_limit_gb = cfg.vm_limit_gb,
            latency_ms = latency.as_millis() as u64,
            affinity = cfg.affinity_step.is_some(),
            "Execution pool created"
        );
        Ok(Self {
            affinity: AffinityMap::from_config(&cfg),
            probe,
            vm_limit,
            latency,
            grace: cfg.term_grace,
            chained: cfg.chained_constraints,
            wks_num: cfg.workers,
            cur_wks: cfg.workers,
            waiting: VecDeque::new(),
            active: (0..cfg.workers).map(|_| None).collect(),
            finished: Vec::new(),
            tasks: Vec::new(),
            names: HashSet::new(),
            category_peak: HashMap::new(),
            snapshot: Arc::new(RwLock::new(PoolSnapshot::default())),
            cancel: None,
            alive: true,
            tstart: Utc::now(),
        })
    }

    /// Cooperative finalization: the pool drains on the next tick once the
    /// token is cancelled, typically from a SIGTERM/SIGINT listener
    /// installed by the embedder.
    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = Some(token);
    }

    /// Shared handle the observation endpoint reads from.
    pub fn snapshot_handle(&self) -> SnapshotHandle {
        Arc::clone(&self.snapshot)
    }

    pub fn workers(&self) -> usize {
        self.wks_num
    }

    pub fn cur_workers(&self) -> usize {
        self.cur_wks
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.iter().flatten().count()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Submit a job for asynchronous execution.
    ///
    /// Starts the job immediately when a slot is free and the predicted
    /// vmem fits the budget, otherwise appends it to the FIFO waiting
    /// queue. Never blocks beyond the spawn itself.
    pub async fn execute(&mut self, mut job: Job) -> Result<()> {
        if !self.alive {
            return Err(PoolError::Terminated("the pool is finalized".into()));
        }
        self.validate_job(&job)?;
        self.admit(&mut job).await;

        // A non-empty queue always wins the free slot: immediate start would
        // let the newcomer overtake the FIFO order.
        let slot = if self.waiting.is_empty() {
            self.free_slot()
        } else {
            None
        };
        match slot {
            Some(slot) if self.fits_budget(&job) => {
                self.start_job(job, slot).await?;
            }
            _ => {
                job.state = JobState::Waiting;
                tracing::debug!(job = %job.name, "Job queued");
                self.waiting.push_back(job);
            }
        }
        self.publish_snapshot().await;
        Ok(())
    }

    /// Run a job inline, bypassing the slots, and return its exit code.
    pub async fn execute_sync(&mut self, mut job: Job) -> Result<i32> {
        if !self.alive {
            return Err(PoolError::Terminated("the pool is finalized".into()));
        }
        self.validate_job(&job)?;
        self.admit(&mut job).await;

        if let Some(task) = job.task.clone() {
            task.lock().await.mark_started();
        }
        if job.argv.is_empty() {
            self.finish_stub(job).await;
            return Ok(0);
        }
        // Inline execution runs in the caller's context, unpinned.
        job.omit_affinity = true;
        if let Err(err) = job.spawn(0, &self.affinity) {
            self.discard_failed_spawn(job).await;
            return Err(err);
        }
        job.run_on_start();
        if !job.start_delay.is_zero() {
            tokio::time::sleep(job.start_delay).await;
        }
        let rcode = job.wait().await;
        self.finalize_exit(job, rcode).await;
        self.publish_snapshot().await;
        Ok(rcode)
    }

    /// Run the supervisor until both the active set and the waiting queue
    /// drain (`true`) or the global deadline fires (`false`, with every
    /// active job terminated and the queue cleared).
    pub async fn join(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                tracing::warn!("Finalization requested, draining the pool");
                self.shutdown().await;
                self.publish_snapshot().await;
                return false;
            }
            self.tick().await;
            self.publish_snapshot().await;
            if self.active_len() == 0 && self.waiting.is_empty() {
                return true;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    tracing::warn!("Global deadline exceeded, terminating active jobs");
                    self.shutdown().await;
                    self.publish_snapshot().await;
                    return false;
                }
            }
            let mut sleep_for = self.latency;
            if let Some(deadline) = deadline {
                sleep_for = sleep_for.min(deadline.saturating_duration_since(Instant::now()));
            }
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Terminate every active job and clear the waiting queue without
    /// invoking `on_done`. Idempotent; also reached from the cancellation
    /// token and the global deadline.
    pub async fn shutdown(&mut self) {
        if !self.alive {
            return;
        }
        self.alive = false;
        tracing::info!("Finalizing the pool");
        for slot in 0..self.active.len() {
            if let Some(mut job) = self.active[slot].take() {
                job.terminate(self.grace).await;
                self.finalize_failed(job).await;
            }
        }
        while let Some(mut job) = self.waiting.pop_front() {
            job.state = JobState::FinishedFail;
            job.tstop = Some(Utc::now());
            self.count_terminated(&job).await;
            self.finished.push(job);
        }
    }

    fn validate_job(&self, job: &Job) -> Result<()> {
        let invalid = |reason: &str| PoolError::JobInvalid {
            job: job.name.clone(),
            reason: reason.into(),
        };
        if job.name.is_empty() {
            return Err(invalid("empty name"));
        }
        if self.names.contains(&job.name) {
            return Err(invalid("duplicate name"));
        }
        if job.state() != JobState::Unsubmitted {
            return Err(invalid("already submitted"));
        }
        if !(job.slowdown.is_finite() && job.slowdown > 0.0) {
            return Err(invalid("slowdown must be a positive finite number"));
        }
        if job.stdout == StdioTarget::ToStdout {
            return Err(invalid("stdout cannot merge into itself"));
        }
        Ok(())
    }

    /// Bookkeeping shared by both admission paths: reserve the name, track
    /// the task, bump its counter and resolve inherited stdio targets.
    async fn admit(&mut self, job: &mut Job) {
        self.names.insert(job.name.clone());
        if let Some(task) = job.task.clone() {
            if !self.tasks.iter().any(|t| Arc::ptr_eq(t, &task)) {
                self.tasks.push(Arc::clone(&task));
            }
            let mut t = task.lock().await;
            t.num_added += 1;
            if job.stdout == StdioTarget::Inherit {
                job.stdout = t.stdout.clone();
            }
            if job.stderr == StdioTarget::Inherit {
                job.stderr = t.stderr.clone();
            }
        }
    }

    /// First free slot within the effective worker count. After a shrink,
    /// jobs may still occupy high slots; the count guard keeps the active
    /// set within `cur_wks` regardless.
    fn free_slot(&self) -> Option<usize> {
        if self.active_len() >= self.cur_wks {
            return None;
        }
        (0..self.cur_wks.min(self.active.len())).find(|&s| self.active[s].is_none())
    }

    fn total_vmem(&self) -> u64 {
        self.active.iter().flatten().map(|j| j.vmem_smooth).sum()
    }

    /// Expected footprint: the peak of the largest completed same-category
    /// job not exceeding this size, or the job's own high-water mark after
    /// an eviction, whichever is larger.
    fn predicted_vmem(&self, job: &Job) -> u64 {
        let predicted = match (&job.category, job.size.known()) {
            (Some(cat), Some(size)) if size > 0 => self
                .category_peak
                .get(cat)
                .and_then(|peaks| peaks.range(..=size).next_back())
                .map(|(_, &vmem)| vmem)
                .unwrap_or(0),
            _ => 0,
        };
        predicted.max(job.vmem_smooth)
    }

    /// Admission control against the memory budget. Active jobs count with
    /// their predicted footprint, not just the usage sampled so far, so a
    /// just-started sibling still reserves its expected share. An empty
    /// active set always admits to guarantee forward progress.
    fn fits_budget(&self, job: &Job) -> bool {
        if self.vm_limit == 0 {
            return true;
        }
        if self.active_len() == 0 {
            return true;
        }
        let reserved: u64 = self
            .active
            .iter()
            .flatten()
            .map(|j| self.predicted_vmem(j))
            .sum();
        reserved + self.predicted_vmem(job) <= self.vm_limit
    }

    /// Start a job on a slot: spawn, pin, fire `on_start`, then the
    /// caller-side start delay. Stub jobs (empty argv) complete inline.
    async fn start_job(&mut self, mut job: Job, slot: usize) -> Result<()> {
        if let Some(task) = job.task.clone() {
            task.lock().await.mark_started();
        }
        if job.argv.is_empty() {
            self.finish_stub(job).await;
            return Ok(());
        }
        if let Err(err) = job.spawn(slot, &self.affinity) {
            tracing::error!(job = %job.name, error = %err, "Spawn failed");
            self.discard_failed_spawn(job).await;
            return Err(err);
        }
        job.run_on_start();
        let delay = job.start_delay;
        self.active[slot] = Some(job);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    /// Stub jobs only sequence callbacks: started and finished in one step.
    async fn finish_stub(&mut self, mut job: Job) {
        let now = Utc::now();
        job.tstart = Some(now);
        job.run_on_start();
        job.rcode = Some(0);
        job.tstop = Some(now);
        job.state = JobState::FinishedOk;
        job.run_on_done();
        if let Some(task) = job.task.clone() {
            let mut t = task.lock().await;
            t.job_done();
            t.try_finish();
        }
        tracing::debug!(job = %job.name, "Stub job completed");
        self.finished.push(job);
    }

    /// A job the OS refused to start is removed without `on_done`.
    async fn discard_failed_spawn(&mut self, mut job: Job) {
        job.state = JobState::FinishedFail;
        job.tstop = Some(Utc::now());
        self.count_terminated(&job).await;
        self.finished.push(job);
    }

    /// One supervisor pass: poll and time out active jobs, sample memory,
    /// enforce task deadlines, evict over budget, promote the queue.
    async fn tick(&mut self) {
        for slot in 0..self.active.len() {
            let Some(mut job) = self.active[slot].take() else {
                continue;
            };
            if let Some(rcode) = job.poll() {
                self.finalize_exit(job, rcode).await;
                continue;
            }
            if !job.timeout.is_zero() && job.attempt_elapsed() > job.timeout {
                match job.on_timeout {
                    TimeoutAction::Restart => {
                        tracing::info!(job = %job.name, "Timeout, restarting in place");
                        match job.restart(slot, &self.affinity, self.grace).await {
                            Ok(()) => {
                                let delay = job.start_delay;
                                self.active[slot] = Some(job);
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                            }
                            Err(err) => {
                                tracing::error!(job = %job.name, error = %err, "Restart failed");
                                self.finalize_failed(job).await;
                            }
                        }
                    }
                    TimeoutAction::Terminate => {
                        tracing::info!(job = %job.name, "Timeout, terminating");
                        job.terminate(self.grace).await;
                        self.finalize_failed(job).await;
                    }
                }
                continue;
            }
            if let Some(pid) = job.pid {
                if let Some(sample) = self.probe.sample_tree(pid) {
                    job.vmem_smooth = probe::smooth(job.vmem_smooth, sample);
                }
            }
            self.active[slot] = Some(job);
        }

        self.enforce_task_timeouts().await;

        if self.vm_limit > 0 {
            let total = self.total_vmem();
            if total > self.vm_limit {
                self.evict(total).await;
            }
        }

        self.promote().await;
    }

    /// A normally exited job: record stats, fire `on_done` on success,
    /// close task counters.
    async fn finalize_exit(&mut self, mut job: Job, rcode: i32) {
        job.rcode = Some(rcode);
        job.tstop = Some(Utc::now());
        job.worker_slot = None;
        self.record_category_peak(&job);
        if rcode == 0 {
            job.state = JobState::FinishedOk;
            job.run_on_done();
            if let Some(task) = job.task.clone() {
                let mut t = task.lock().await;
                t.job_done();
                t.try_finish();
            }
        } else {
            job.state = JobState::FinishedFail;
            self.count_terminated(&job).await;
        }
        tracing::info!(job = %job.name, rcode, "Job finished");
        self.finished.push(job);
    }

    /// A terminated job: no `on_done`, counted under the task terminations.
    async fn finalize_failed(&mut self, mut job: Job) {
        job.tstop = Some(Utc::now());
        job.worker_slot = None;
        self.record_category_peak(&job);
        job.state = JobState::FinishedFail;
        self.count_terminated(&job).await;
        self.finished.push(job);
    }

    async fn count_terminated(&self, job: &Job) {
        if let Some(task) = job.task.clone() {
            let mut t = task.lock().await;
            t.job_terminated();
            t.try_finish();
        }
    }

    fn record_category_peak(&mut self, job: &Job) {
        if let Some((cat, size)) = job.chain_key() {
            if job.vmem_smooth > 0 {
                let peaks = self.category_peak.entry(cat.to_string()).or_default();
                let peak = peaks.entry(size).or_insert(0);
                *peak = (*peak).max(job.vmem_smooth);
            }
        }
    }

    /// Terminate the remaining jobs of tasks whose own deadline expired.
    async fn enforce_task_timeouts(&mut self) {
        let now = Utc::now();
        let mut expired: Vec<TaskRef> = Vec::new();
        for task in &self.tasks {
            let t = task.lock().await;
            if t.tstop.is_some() || t.timeout.is_zero() {
                continue;
            }
            let overdue = t.tstart.is_some_and(|tstart| {
                now.signed_duration_since(tstart)
                    .to_std()
                    .map(|elapsed| elapsed > t.timeout)
                    .unwrap_or(false)
            });
            if overdue {
                expired.push(Arc::clone(task));
            }
        }

        for task in expired {
            {
                let t = task.lock().await;
                tracing::warn!(task = %t.name, "Task timeout, terminating attached jobs");
            }
            for slot in 0..self.active.len() {
                let belongs = self.active[slot]
                    .as_ref()
                    .is_some_and(|job| job_in_task(job, &task));
                if !belongs {
                    continue;
                }
                if let Some(mut job) = self.active[slot].take() {
                    job.terminate(self.grace).await;
                    self.finalize_failed(job).await;
                }
            }
            let mut kept = VecDeque::with_capacity(self.waiting.len());
            while let Some(mut job) = self.waiting.pop_front() {
                if job_in_task(&job, &task) {
                    job.state = JobState::FinishedFail;
                    job.tstop = Some(Utc::now());
                    self.count_terminated(&job).await;
                    self.finished.push(job);
                } else {
                    kept.push_back(job);
                }
            }
            self.waiting = kept;
        }
    }

    /// Chained rescheduling under memory pressure: evict the heaviest jobs
    /// together with their category chains, requeue them at the front in
    /// decreasing-size order and shrink the effective worker count.
    async fn evict(&mut self, total: u64) {
        let cands: Vec<EvictCandidate> = self
            .active
            .iter()
            .enumerate()
            .filter_map(|(slot, job)| {
                job.as_ref().map(|j| EvictCandidate {
                    slot,
                    chain: j.chain_key().map(|(c, s)| (c.to_string(), s)),
                    vmem: j.vmem_smooth,
                })
            })
            .collect();
        let slots = plan_eviction(&cands, total, self.vm_limit, self.chained);
        if slots.is_empty() {
            return;
        }

        let mut evicted = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(mut job) = self.active[slot].take() {
                tracing::warn!(
                    job = %job.name,
                    vmem = job.vmem_smooth,
                    category = ?job.category,
                    "Evicting for memory, rescheduling"
                );
                job.terminate(self.grace).await;
                job.state = JobState::Waiting;
                job.worker_slot = None;
                job.rcode = None;
                job.attempt_start = None;
                evicted.push(job);
            }
        }
        // Push-front in decreasing size leaves the smaller siblings at the
        // head, so larger jobs retry only after they complete.
        evicted.sort_by_key(|j| std::cmp::Reverse(j.size.known().unwrap_or(0)));
        for job in evicted {
            self.waiting.push_front(job);
        }
        if self.cur_wks > 1 {
            self.cur_wks -= 1;
            tracing::info!(workers = self.cur_wks, "Worker count reduced under memory pressure");
        }
    }

    /// Admit waiting jobs onto free slots, strict FIFO: a head that does
    /// not fit the budget blocks everything behind it.
    async fn promote(&mut self) {
        loop {
            let Some(slot) = self.free_slot() else {
                break;
            };
            let fits = match self.waiting.front() {
                Some(job) => self.fits_budget(job),
                None => break,
            };
            if !fits {
                break;
            }
            let Some(job) = self.waiting.pop_front() else {
                break;
            };
            let name = job.name.clone();
            if let Err(err) = self.start_job(job, slot).await {
                tracing::error!(job = %name, error = %err, "Failed to start queued job");
            }
        }
    }

    async fn publish_snapshot(&self) {
        let snap = self.build_snapshot().await;
        *self.snapshot.write().await = snap;
    }

    async fn build_snapshot(&self) -> PoolSnapshot {
        let now = Utc::now();
        let mut jobs: Vec<SnapshotEntry> = Vec::new();
        for job in self.active.iter().flatten() {
            jobs.push(self.job_entry(job, now).await);
        }
        for job in &self.waiting {
            jobs.push(self.job_entry(job, now).await);
        }
        let mut failures: Vec<SnapshotEntry> = Vec::new();
        for job in self.finished.iter().filter(|j| j.rcode != Some(0)) {
            failures.push(self.job_entry(job, now).await);
        }
        let mut tasks = Vec::new();
        for task in &self.tasks {
            let t = task.lock().await;
            if t.tstart.is_none() {
                continue;
            }
            let entry = task_entry(&t, now);
            if t.has_failures() {
                failures.push(entry.clone());
            }
            tasks.push(entry);
        }
        PoolSnapshot {
            failures,
            jobs,
            tasks,
        }
    }

    async fn job_entry(&self, job: &Job, now: DateTime<Utc>) -> SnapshotEntry {
        let end = job.tstop.or(job.tstart.map(|_| now));
        let duration = match (job.tstart, end) {
            (Some(beg), Some(end)) => Some(
                end.signed_duration_since(beg)
                    .num_milliseconds()
                    .max(0) as f64
                    / 1000.0,
            ),
            _ => None,
        };
        SnapshotEntry {
            category: job.category.clone(),
            rcode: job.rcode,
            duration,
            memkind: Some(u8::from(self.probe.is_available())),
            memsize: (job.vmem_smooth > 0).then_some(job.vmem_smooth),
            name: job.name.clone(),
            numadded: None,
            numdone: None,
            numterm: None,
            pid: job.pid,
            task: job.task_name().await,
            tstart: job.tstart,
            tstop: job.tstop,
        }
    }
}

fn task_entry(task: &crate::pool::task::Task, now: DateTime<Utc>) -> SnapshotEntry {
    let end = task.tstop.or(task.tstart.map(|_| now));
    let duration = match (task.tstart, end) {
        (Some(beg), Some(end)) => Some(
            end.signed_duration_since(beg)
                .num_milliseconds()
                .max(0) as f64
                / 1000.0,
        ),
        _ => None,
    };
    SnapshotEntry {
        category: None,
        rcode: None,
        duration,
        memkind: None,
        memsize: None,
        name: task.name.clone(),
        numadded: Some(task.num_added),
        numdone: Some(task.num_done),
        numterm: Some(task.num_term),
        pid: None,
        task: None,
        tstart: task.tstart,
        tstop: task.tstop,
    }
}

fn job_in_task(job: &Job, task: &TaskRef) -> bool {
    job.task.as_ref().is_some_and(|t| Arc::ptr_eq(t, task))
}

impl Drop for ExecPool {
    fn drop(&mut self) {
        // Children also carry kill_on_drop as a backstop.
        for job in self.active.iter_mut().flatten() {
            if let Some(child) = job.child.as_mut() {
                let _ = child.start_kill();
            }
        }
    }
}

/// Eviction candidate: chain carries (category, size) only when the job is
/// chain-eligible.
#[derive(Debug, Clone)]
pub(crate) struct EvictCandidate {
    pub slot: usize,
    pub chain: Option<(String, u64)>,
    pub vmem: u64,
}

/// Pick the slots to evict: heaviest first until the total fits the limit,
/// dragging every same-category job of equal or larger size along in the
/// same round.
pub(crate) fn plan_eviction(
    cands: &[EvictCandidate],
    mut total: u64,
    limit: u64,
    chained: bool,
) -> Vec<usize> {
    let mut order: Vec<usize> = (0..cands.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(cands[i].vmem));
    let mut taken = vec![false; cands.len()];
    let mut out = Vec::new();
    for &i in &order {
        if total <= limit {
            break;
        }
        if taken[i] {
            continue;
        }
        taken[i] = true;
        out.push(cands[i].slot);
        total = total.saturating_sub(cands[i].vmem);
        let Some((cat, size)) = (if chained { cands[i].chain.as_ref() } else { None }) else {
            continue;
        };
        for (j, cand) in cands.iter().enumerate() {
            if taken[j] {
                continue;
            }
            if let Some((c2, s2)) = &cand.chain {
                if c2 == cat && s2 >= size {
                    taken[j] = true;
                    out.push(cand.slot);
                    total = total.saturating_sub(cand.vmem);
                }
            }
        }
    }
    out
}
