//! Supervisor failure taxonomy.

use thiserror::Error;

use crate::supervisor::ThreadState;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Operation on a destroyed supervisor. Late callers that raced the
    /// teardown observe this instead of touching freed state.
    #[error("supervisor destroyed")]
    SupervisorGone,

    #[error("thread {0} not found")]
    ThreadNotFound(u64),

    #[error("attachment tag not found: {0}")]
    AttachmentNotFound(String),

    /// Adding a tag that already exists fails.
    #[error("attachment tag already registered: {0}")]
    TagExists(String),

    /// E.g. pausing a Stopped thread.
    #[error("invalid transition for thread {id}: cannot {operation} from {from:?}")]
    InvalidTransition {
        id: u64,
        from: ThreadState,
        operation: &'static str,
    },

    /// Stdin/stdout/stderr operation on an in-process worker.
    #[error("thread {0} is not a child process")]
    NotAProcess(u64),

    /// Exit status requested before the record reached Stopped.
    #[error("exit status for thread {0} is not available yet")]
    ExitStatusUnavailable(u64),

    #[error("signal delivery failed: {0}")]
    Signal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
