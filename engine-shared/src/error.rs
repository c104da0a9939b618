//! Error taxonomy for the outreach task-execution engine
//!
//! Every variant here corresponds to one of the error classes from the
//! engine's error-handling design: a handful are surfaced directly to
//! callers of the Task Manager facade, the rest are swallowed internally and
//! only change a task's terminal status and message.

use thiserror::Error;

/// Errors the engine can produce. Caller-facing variants are returned from
/// `TaskManager` operations; the rest are only ever observed inside the
/// scheduler loop, where they are mapped onto a task's final status.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad payload shape or value (surfaced from Submit/Update).
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A caller-supplied task id already exists.
    #[error("duplicate task id: {0}")]
    DuplicateId(String),

    /// No task exists with the given id.
    #[error("task not found: {0}")]
    NotFound(String),

    /// Update/Rename/RunNow attempted on a task that is not `pending`.
    #[error("task {0} is not pending")]
    NotPending(String),

    /// Update would rename `task_dir` onto a path that already exists.
    #[error("target directory already exists: {0}")]
    CollidingDir(String),

    /// No account in the pool could be matched to a task's region.
    #[error("no account available: {0}")]
    ResourceUnavailable(String),

    /// The browser-automation driver's connection is gone. The session that
    /// produced it is torn down; the scheduler may retry against a fresh one.
    #[error("driver connection closed: {0}")]
    DriverClosed(String),

    /// Any other exception raised out of a `WorkerDriver::run` call.
    #[error("driver error: {0}")]
    DriverError(String),

    /// A store write failed. Logged, never fatal: the next successful
    /// persist overwrites whatever was missed.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A task's `run_end_time` elapsed before the driver returned.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Normal cancellation path (Cancel/ForceCancel/shutdown).
    #[error("task cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EngineError>;
