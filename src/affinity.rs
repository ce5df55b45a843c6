use nix::sched::{sched_setaffinity, CpuSet};
use nix::unistd::Pid;

use crate::config::PoolConfig;

/// Maps worker slot indices to CPU ids honoring the host NUMA layout.
///
/// The affinity table is the CPU table reduced by the non-primary hardware
/// threads of each core. When CPUs are enumerated across nodes (node0 gets
/// even ids, node1 odd ids, ...), primary threads sit at
/// `i + i/nodes * nodes * (core_threads - 1)`; with sequential enumeration
/// they sit at `i * core_threads`.
///
/// A step larger than 1 spreads workers over the table to give each one more
/// cache; callers are expected to reduce `workers` accordingly.
#[derive(Debug, Clone)]
pub struct AffinityMap {
    step: Option<usize>,
    core_threads: usize,
    numa_nodes: usize,
    cross_nodes: bool,
}

impl AffinityMap {
    pub fn new(
        step: Option<usize>,
        core_threads: usize,
        numa_nodes: usize,
        cross_nodes: bool,
    ) -> Self {
        Self {
            step,
            core_threads,
            numa_nodes,
            cross_nodes,
        }
    }

    pub fn from_config(cfg: &PoolConfig) -> Self {
        Self::new(
            cfg.affinity_step,
            cfg.core_threads,
            cfg.numa_nodes,
            cfg.cross_nodes,
        )
    }

    /// Pinning is skipped entirely when no affinity step is configured.
    pub fn is_enabled(&self) -> bool {
        self.step.is_some()
    }

    /// CPU id for a worker slot, or `None` when pinning is disabled.
    pub fn cpu_for_slot(&self, slot: usize) -> Option<usize> {
        let step = self.step?;
        let i = slot * step;
        Some(if self.cross_nodes {
            i + i / self.numa_nodes * self.numa_nodes * (self.core_threads - 1)
        } else {
            i * self.core_threads
        })
    }

    /// Bind a spawned child to the CPU of its worker slot.
    ///
    /// The mask is set once on spawn and never mutated afterwards.
    pub fn pin(&self, pid: u32, slot: usize) -> nix::Result<()> {
        let Some(cpu) = self.cpu_for_slot(slot) else {
            return Ok(());
        };
        let mut set = CpuSet::new();
        set.set(cpu)?;
        sched_setaffinity(Pid::from_raw(pid as i32), &set)
    }
}
