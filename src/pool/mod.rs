pub mod job;
pub mod supervisor;
pub mod task;

pub use job::{Job, JobHooks, JobSize, JobState, NoHooks, StdioTarget, TimeoutAction};
pub use supervisor::ExecPool;
pub use task::{Task, TaskHooks, TaskRef};
