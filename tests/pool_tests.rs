use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use procpool::{ExecPool, Job, JobHooks, PoolConfig, StdioTarget, TimeoutAction};

/// Hook set counting invocations through shared atomics.
struct Counters {
    started: Arc<AtomicU32>,
    done: Arc<AtomicU32>,
}

impl JobHooks for Counters {
    fn on_start(&mut self, _job: &Job) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_done(&mut self, _job: &Job) {
        self.done.fetch_add(1, Ordering::SeqCst);
    }
}

fn counters() -> (Arc<AtomicU32>, Arc<AtomicU32>, Counters) {
    let started = Arc::new(AtomicU32::new(0));
    let done = Arc::new(AtomicU32::new(0));
    let hooks = Counters {
        started: started.clone(),
        done: done.clone(),
    };
    (started, done, hooks)
}

fn quick_pool(workers: usize) -> ExecPool {
    ExecPool::new(
        PoolConfig::new(workers)
            .with_latency(Duration::from_millis(100))
            .with_term_grace(Duration::from_millis(500)),
    )
    .unwrap()
}

#[tokio::test]
async fn basic_drain_fires_on_done_once() {
    let mut pool = quick_pool(1);
    let (started, done, hooks) = counters();

    pool.execute(Job::new("ok", vec!["true".into()]).with_hooks(hooks))
        .await
        .unwrap();
    assert!(pool.join(Some(Duration::from_secs(5))).await);

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);

    let snap = pool.snapshot_handle();
    let snap = snap.read().await;
    assert!(snap.jobs.is_empty());
    assert!(snap.failures.is_empty());
}

#[tokio::test]
async fn timeout_terminates_without_on_done() {
    let mut pool = quick_pool(1);
    let (_, done, hooks) = counters();

    let begin = Instant::now();
    pool.execute(
        Job::new("slow", vec!["sleep".into(), "10".into()])
            .with_timeout(Duration::from_secs(1), TimeoutAction::Terminate)
            .with_hooks(hooks),
    )
    .await
    .unwrap();
    assert!(pool.join(Some(Duration::from_secs(10))).await);
    let elapsed = begin.elapsed();

    // Killed at the timeout, within one latency plus the grace.
    assert!(elapsed >= Duration::from_secs(1), "finished early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "finished late: {elapsed:?}");
    assert_eq!(done.load(Ordering::SeqCst), 0);

    let snap = pool.snapshot_handle();
    let snap = snap.read().await;
    let failure = snap.failures.iter().find(|e| e.name == "slow").unwrap();
    assert_eq!(failure.rcode, Some(-15));
    assert!(failure.duration.unwrap() >= 1.0);
}

#[tokio::test]
async fn timeout_restarts_in_place() {
    let mut pool = quick_pool(1);
    let (started, done, hooks) = counters();

    pool.execute(
        Job::new("flappy", vec!["sleep".into(), "10".into()])
            .with_timeout(Duration::from_millis(400), TimeoutAction::Restart)
            .with_hooks(hooks),
    )
    .await
    .unwrap();
    // The job never finishes; the global deadline drains the pool.
    assert!(!pool.join(Some(Duration::from_secs(2))).await);

    assert!(
        started.load(Ordering::SeqCst) >= 2,
        "expected at least one restart, got {} starts",
        started.load(Ordering::SeqCst)
    );
    assert_eq!(done.load(Ordering::SeqCst), 0);
    assert_eq!(pool.active_len(), 0);
    assert_eq!(pool.waiting_len(), 0);
}

#[tokio::test]
async fn sync_execution_returns_the_exit_code() {
    let mut pool = quick_pool(1);
    let rcode = pool
        .execute_sync(Job::new(
            "failing",
            vec!["sh".into(), "-c".into(), "exit 3".into()],
        ))
        .await
        .unwrap();
    assert_eq!(rcode, 3);

    let (_, done, hooks) = counters();
    let rcode = pool
        .execute_sync(Job::new("passing", vec!["true".into()]).with_hooks(hooks))
        .await
        .unwrap();
    assert_eq!(rcode, 0);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stub_job_runs_callbacks_only() {
    let mut pool = quick_pool(1);
    let (started, done, hooks) = counters();

    pool.execute(Job::new("stub", vec![]).with_hooks(hooks))
        .await
        .unwrap();
    assert!(pool.join(Some(Duration::from_secs(2))).await);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(done.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejects_invalid_submissions() {
    let mut pool = quick_pool(1);

    assert!(pool.execute(Job::new("", vec!["true".into()])).await.is_err());
    assert!(pool
        .execute(Job::new("bad-slowdown", vec!["true".into()]).with_slowdown(0.0))
        .await
        .is_err());
    assert!(pool
        .execute(Job::new("bad-stdout", vec!["true".into()]).with_stdout(StdioTarget::ToStdout))
        .await
        .is_err());

    pool.execute(Job::new("unique", vec!["true".into()]))
        .await
        .unwrap();
    assert!(pool
        .execute(Job::new("unique", vec!["true".into()]))
        .await
        .is_err());
    assert!(pool.join(Some(Duration::from_secs(5))).await);
}

#[tokio::test]
async fn spawn_failure_surfaces_without_on_done() {
    let mut pool = quick_pool(1);
    let (_, done, hooks) = counters();
    let err = pool
        .execute(Job::new("ghost", vec!["/nonexistent/binary-12345".into()]).with_hooks(hooks))
        .await;
    assert!(err.is_err());
    assert_eq!(done.load(Ordering::SeqCst), 0);
    assert!(pool.join(Some(Duration::from_secs(2))).await);
}

#[tokio::test]
async fn active_set_stays_within_the_slots() {
    let mut pool = quick_pool(2);
    let (_, done, _) = counters();

    for i in 0..4 {
        let hooks = Counters {
            started: Arc::new(AtomicU32::new(0)),
            done: done.clone(),
        };
        pool.execute(
            Job::new(format!("batch-{i}"), vec!["sleep".into(), "0.3".into()]).with_hooks(hooks),
        )
        .await
        .unwrap();
        assert!(pool.active_len() <= 2);
    }
    assert_eq!(pool.active_len(), 2);
    assert_eq!(pool.waiting_len(), 2);

    assert!(pool.join(Some(Duration::from_secs(10))).await);
    assert_eq!(done.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn stdout_redirects_to_a_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.log");
    let mut pool = quick_pool(1);

    pool.execute(
        Job::new(
            "writer",
            vec!["sh".into(), "-c".into(), "echo hello".into()],
        )
        .with_stdout(StdioTarget::File(path.clone())),
    )
    .await
    .unwrap();
    assert!(pool.join(Some(Duration::from_secs(5))).await);

    let out = std::fs::read_to_string(path).unwrap();
    assert_eq!(out, "hello\n");
}

#[tokio::test]
async fn global_deadline_drains_everything() {
    let mut pool = quick_pool(1);
    let (_, done, hooks) = counters();

    pool.execute(
        Job::new("runner", vec!["sleep".into(), "10".into()]).with_hooks(hooks),
    )
    .await
    .unwrap();
    pool.execute(Job::new("queued", vec!["sleep".into(), "10".into()]))
        .await
        .unwrap();

    let begin = Instant::now();
    assert!(!pool.join(Some(Duration::from_secs(1))).await);
    // Bounded by the deadline plus latency and grace.
    assert!(begin.elapsed() < Duration::from_secs(4));
    assert_eq!(pool.active_len(), 0);
    assert_eq!(pool.waiting_len(), 0);
    assert_eq!(done.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let mut pool = quick_pool(1);
    pool.execute(Job::new("victim", vec!["sleep".into(), "10".into()]))
        .await
        .unwrap();

    pool.shutdown().await;
    pool.shutdown().await;
    assert!(!pool.is_alive());
    assert_eq!(pool.active_len(), 0);

    // A finalized pool refuses new work but still joins cleanly.
    assert!(pool.execute(Job::new("late", vec!["true".into()])).await.is_err());
    assert!(pool.join(Some(Duration::from_secs(1))).await);
}
