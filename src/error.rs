use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid job {job}: {reason}")]
    JobInvalid { job: String, reason: String },

    #[error("Failed to spawn job {job}: {source}")]
    SpawnFailed {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to redirect stdio for job {job}: {source}")]
    StdioFailed {
        job: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process memory accounting is unavailable on this system")]
    MemoryProbeUnavailable,

    #[error("Global deadline exceeded")]
    DeadlineExceeded,

    #[error("Terminated: {0}")]
    Terminated(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
