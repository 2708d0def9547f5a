//! Error taxonomy surfaced at the queue façade boundary.

use thiserror::Error;

/// Errors the queue façade can return to a caller. Internal helpers use
/// `anyhow::Result` and attach context; this enum is only constructed where
/// a caller needs to match on a specific kind.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full ({current}/{limit} jobs on disk)")]
    JobQueueFull { current: usize, limit: usize },

    #[error("queue is in drained mode, new jobs are not accepted")]
    JobQueueDrainError,

    #[error("queue is shutting down")]
    JobQueueShuttingDown,

    #[error("job {0} could not be found")]
    JobLost(u64),

    #[error("job file for {0} is corrupted and was archived: {1}")]
    JobFileCorrupted(u64, String),

    #[error("{0}")]
    Generic(String),

    #[error("internal invariant violated: {0}")]
    ProgrammerError(String),
}

impl QueueError {
    pub fn generic(msg: impl Into<String>) -> Self {
        QueueError::Generic(msg.into())
    }
}

/// Panics with a `ProgrammerError`-flavored message. Used for invariant
/// violations that should never happen in practice: the job queue aborts
/// rather than try to continue in a state it cannot explain.
#[track_caller]
pub fn bug(msg: impl AsRef<str>) -> ! {
    panic!("programmer error: {}", msg.as_ref());
}
