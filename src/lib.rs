pub mod affinity;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod pool;
pub mod probe;
pub mod snapshot;

pub use affinity::AffinityMap;
pub use config::PoolConfig;
pub use error::{PoolError, Result};
pub use pool::{
    ExecPool, Job, JobHooks, JobSize, JobState, NoHooks, StdioTarget, Task, TaskHooks, TaskRef,
    TimeoutAction,
};
pub use probe::MemoryProbe;
pub use snapshot::{Filter, PoolSnapshot, SnapshotEntry, SnapshotHandle};
