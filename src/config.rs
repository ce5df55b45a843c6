use std::time::Duration;

use crate::error::{PoolError, Result};

/// Supervisor wake-up period used when the caller leaves `latency` at zero.
pub const DEFAULT_LATENCY: Duration = Duration::from_millis(2500);

/// Grace period between SIGTERM and SIGKILL when terminating a job.
pub const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(2);

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots (`wks_num`).
    pub workers: usize,
    /// Affinity step between consecutive worker slots; `None` disables CPU pinning.
    pub affinity_step: Option<usize>,
    /// Hardware threads per physical core.
    pub core_threads: usize,
    /// NUMA nodes on the host.
    pub numa_nodes: usize,
    /// CPUs are enumerated across nodes (node0 even ids, node1 odd ids).
    pub cross_nodes: bool,
    /// Global virtual-memory ceiling in GiB over all active jobs; 0 = unlimited.
    pub vm_limit_gb: f64,
    /// Supervisor wake-up period; zero selects `DEFAULT_LATENCY`.
    pub latency: Duration,
    /// Grace between the polite signal and the forced kill.
    pub term_grace: Duration,
    /// Evict whole category chains instead of individual jobs.
    pub chained_constraints: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            affinity_step: None,
            core_threads: 1,
            numa_nodes: 1,
            cross_nodes: true,
            vm_limit_gb: 0.0,
            latency: Duration::ZERO,
            term_grace: DEFAULT_TERM_GRACE,
            chained_constraints: true,
        }
    }
}

impl PoolConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    pub fn with_affinity_step(mut self, step: usize) -> Self {
        self.affinity_step = Some(step);
        self
    }

    pub fn with_topology(mut self, core_threads: usize, numa_nodes: usize) -> Self {
        self.core_threads = core_threads;
        self.numa_nodes = numa_nodes;
        self
    }

    pub fn with_vm_limit_gb(mut self, limit_gb: f64) -> Self {
        self.vm_limit_gb = limit_gb;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_term_grace(mut self, grace: Duration) -> Self {
        self.term_grace = grace;
        self
    }

    pub fn without_chained_constraints(mut self) -> Self {
        self.chained_constraints = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PoolError::ConfigInvalid(
                "workers must be at least 1".into(),
            ));
        }
        if self.affinity_step == Some(0) {
            return Err(PoolError::ConfigInvalid(
                "affinity_step must be at least 1 when set".into(),
            ));
        }
        if self.core_threads == 0 || self.numa_nodes == 0 {
            return Err(PoolError::ConfigInvalid(
                "core_threads and numa_nodes must be at least 1".into(),
            ));
        }
        if !self.vm_limit_gb.is_finite() || self.vm_limit_gb < 0.0 {
            return Err(PoolError::ConfigInvalid(
                "vm_limit_gb must be a non-negative finite number".into(),
            ));
        }
        Ok(())
    }

    /// Memory ceiling in bytes; 0 means unlimited.
    pub fn vm_limit_bytes(&self) -> u64 {
        (self.vm_limit_gb * GIB) as u64
    }

    /// Effective supervisor latency.
    pub fn effective_latency(&self) -> Duration {
        if self.latency.is_zero() {
            DEFAULT_LATENCY
        } else {
            self.latency
        }
    }
}
