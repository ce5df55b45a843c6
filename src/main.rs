use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use procpool::dashboard::{run_dashboard, DashboardState};
use procpool::{ExecPool, Job, JobSize, PoolConfig, StdioTarget, Task, TaskRef, TimeoutAction};

#[derive(Parser, Debug)]
#[command(name = "procpool")]
#[command(about = "Execution pool for external processes under memory and timeout constraints")]
struct Args {
    /// Worker slots; 0 means one per CPU
    #[arg(long, default_value = "0")]
    workers: usize,

    /// Affinity step over the reduced CPU table; omit to disable pinning
    #[arg(long)]
    affinity_step: Option<usize>,

    /// Hardware threads per physical core
    #[arg(long, default_value = "1")]
    core_threads: usize,

    /// NUMA nodes on the host
    #[arg(long, default_value = "1")]
    numa_nodes: usize,

    /// Memory ceiling in GiB over all active jobs; 0 = unlimited
    #[arg(long, default_value = "0")]
    vm_limit_gb: f64,

    /// Supervisor wake-up period in seconds; 0 selects the default
    #[arg(long, default_value = "0")]
    latency_secs: f64,

    /// Global deadline in seconds; 0 = run until drained
    #[arg(long, default_value = "0")]
    timeout_secs: f64,

    /// Port for the web status page (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// JSON job manifest: an array of job specs
    manifest: PathBuf,
}

/// One manifest entry.
#[derive(Debug, Deserialize)]
struct JobSpec {
    name: String,
    #[serde(default)]
    argv: Vec<String>,
    workdir: Option<PathBuf>,
    #[serde(default)]
    timeout_s: f64,
    #[serde(default = "default_on_timeout")]
    on_timeout: TimeoutAction,
    #[serde(default)]
    start_delay_s: f64,
    task: Option<String>,
    category: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(default = "default_slowdown")]
    slowdown: f64,
    stdout: Option<String>,
    stderr: Option<String>,
    #[serde(default)]
    omit_affinity: bool,
}

fn default_on_timeout() -> TimeoutAction {
    TimeoutAction::Terminate
}

fn default_slowdown() -> f64 {
    1.0
}

impl JobSpec {
    fn into_job(self, tasks: &mut HashMap<String, TaskRef>) -> Job {
        let mut job = Job::new(self.name, self.argv)
            .with_timeout(Duration::from_secs_f64(self.timeout_s), self.on_timeout)
            .with_start_delay(Duration::from_secs_f64(self.start_delay_s))
            .with_slowdown(self.slowdown)
            .with_stdout(parse_stdio(self.stdout))
            .with_stderr(parse_stdio(self.stderr));
        if let Some(dir) = self.workdir {
            job = job.with_workdir(dir);
        }
        if let Some(category) = self.category {
            let size = match self.size {
                0 => JobSize::Unknown,
                n => JobSize::Known(n),
            };
            job = job.with_category(category, size);
        }
        if let Some(name) = self.task {
            let task = tasks
                .entry(name.clone())
                .or_insert_with(|| Task::new(name).into_ref());
            job = job.with_task(task.clone());
        }
        if self.omit_affinity {
            job = job.omit_affinity();
        }
        job
    }
}

fn parse_stdio(target: Option<String>) -> StdioTarget {
    match target.as_deref() {
        None | Some("inherit") => StdioTarget::Inherit,
        Some("null") => StdioTarget::Null,
        Some("to_stdout") => StdioTarget::ToStdout,
        Some(path) => StdioTarget::File(PathBuf::from(path)),
    }
}

/// Turn SIGTERM/SIGINT into a cooperative finalization request.
///
/// The handler only cancels the returned token; the supervisor notices it
/// on its next tick (`ExecPool::set_cancel_token`), terminates the active
/// jobs and clears the queue. Nothing pool-related happens in signal
/// context.
fn finalization_token() -> CancellationToken {
    let token = CancellationToken::new();
    let requester = token.clone();

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "Cannot listen for SIGTERM");
                return;
            }
        };
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!(error = %err, "Cannot listen for SIGINT");
                return;
            }
        };

        let received = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        tracing::info!(signal = received, "Requesting pool finalization");
        requester.cancel();
    });

    token
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(err) => {
            tracing::error!(error = %err, "Fatal error");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args) -> Result<bool, Box<dyn std::error::Error>> {
    let manifest = std::fs::read_to_string(&args.manifest)?;
    let specs: Vec<JobSpec> = serde_json::from_str(&manifest)?;

    let workers = if args.workers == 0 {
        PoolConfig::default().workers
    } else {
        args.workers
    };
    let mut cfg = PoolConfig::new(workers)
        .with_topology(args.core_threads, args.numa_nodes)
        .with_vm_limit_gb(args.vm_limit_gb)
        .with_latency(Duration::from_secs_f64(args.latency_secs));
    if let Some(step) = args.affinity_step {
        cfg = cfg.with_affinity_step(step);
    }

    tracing::info!(
        workers,
        vm_limit_gb = args.vm_limit_gb,
        jobs = specs.len(),
        manifest = %args.manifest.display(),
        "Starting procpool"
    );

    let mut pool = ExecPool::new(cfg)?;
    pool.set_cancel_token(finalization_token());

    if let Some(port) = args.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
        let state = DashboardState {
            snapshot: pool.snapshot_handle(),
        };
        tokio::spawn(run_dashboard(addr, state));
    }

    let mut tasks: HashMap<String, TaskRef> = HashMap::new();
    for spec in specs {
        let job = spec.into_job(&mut tasks);
        let name = job.name.clone();
        if let Err(err) = pool.execute(job).await {
            tracing::error!(job = %name, error = %err, "Submission failed");
        }
    }

    let timeout =
        (args.timeout_secs > 0.0).then(|| Duration::from_secs_f64(args.timeout_secs));
    Ok(pool.join(timeout).await)
}
