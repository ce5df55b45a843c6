use std::collections::HashSet;
use std::fs;
use std::path::Path;

use nix::unistd::{sysconf, SysconfVar};

/// Exponential smoothing weight of the previous high-water mark.
const SMOOTH_ALPHA: f64 = 0.9;

const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Samples the memory footprint of a process tree via `/proc`.
///
/// A sample is the sum of (resident + shared) bytes over the root process
/// and all of its descendants. Descendants that vanish mid-walk are simply
/// skipped, yielding a best-effort total.
#[derive(Debug, Clone)]
pub struct MemoryProbe {
    page_size: u64,
    available: bool,
}

impl MemoryProbe {
    pub fn new() -> Self {
        let page_size = sysconf(SysconfVar::PAGE_SIZE)
            .ok()
            .flatten()
            .map(|v| v as u64)
            .unwrap_or(DEFAULT_PAGE_SIZE);
        let available = Path::new("/proc/self/statm").exists();
        if !available {
            tracing::warn!(
                "/proc process accounting is unavailable, memory limiting is disabled"
            );
        }
        Self {
            page_size,
            available,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Resident + shared bytes of `pid` and all its descendants.
    ///
    /// Returns `None` when accounting is unavailable or the root is gone.
    pub fn sample_tree(&self, pid: u32) -> Option<u64> {
        if !self.available {
            return None;
        }
        let mut total = self.sample_one(pid)?;
        let mut visited = HashSet::from([pid]);
        let mut stack = children_of(pid);
        while let Some(child) = stack.pop() {
            if !visited.insert(child) {
                continue;
            }
            if let Some(bytes) = self.sample_one(child) {
                total += bytes;
                stack.extend(children_of(child));
            }
        }
        Some(total)
    }

    /// Resident + shared bytes of a single process from `/proc/<pid>/statm`.
    fn sample_one(&self, pid: u32) -> Option<u64> {
        let statm = fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
        let mut fields = statm.split_ascii_whitespace().skip(1);
        let resident: u64 = fields.next()?.parse().ok()?;
        let shared: u64 = fields.next()?.parse().ok()?;
        Some((resident + shared) * self.page_size)
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

/// Direct children of `pid` over all its threads.
fn children_of(pid: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let Ok(tasks) = fs::read_dir(format!("/proc/{pid}/task")) else {
        return out;
    };
    for task in tasks.flatten() {
        let path = task.path().join("children");
        if let Ok(list) = fs::read_to_string(path) {
            out.extend(
                list.split_ascii_whitespace()
                    .filter_map(|p| p.parse::<u32>().ok()),
            );
        }
    }
    out
}

/// Update the smoothed high-water mark with a fresh sample.
///
/// The `max` keeps the value monotone within an attempt while the
/// exponential term lets it relax gradually across chained reschedules.
pub fn smooth(prev: u64, sample: u64) -> u64 {
    let relaxed = SMOOTH_ALPHA * prev as f64 + (1.0 - SMOOTH_ALPHA) * sample as f64;
    sample.max(relaxed as u64)
}
