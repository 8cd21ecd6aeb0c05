//! Error types for pool operations, jobs and drivers

use std::time::Duration;

use crate::driver::WorkerId;

/// Error reported by a [`WorkerDriver`](crate::driver::WorkerDriver)
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The driver has no worker with this id
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    /// The worker process died or stopped responding mid-conversation
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),

    /// The job ran but the worker reported a failure
    #[error("execution failed: {0}")]
    Execution(String),

    /// Malformed or unexpected message from the worker
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Worker could not be created
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// I/O error talking to the worker
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Driver call exceeded its deadline
    #[error("driver call timed out after {0:?}")]
    Timeout(Duration),
}

impl DriverError {
    /// Whether the worker that produced this error can no longer be used.
    ///
    /// Worker-fatal errors raised by `execute` send the worker through the
    /// failure path (removal and replacement) instead of back to `ready`.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(self, Self::WorkerNotFound(_) | Self::WorkerCrashed(_))
    }
}

/// Error returned by pool management operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Starting another worker would exceed the configured capacity
    #[error("pool is at capacity ({capacity} workers)")]
    CapacityExceeded { capacity: usize },

    /// No worker with this id is in the pool
    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    /// The worker was created but failed its readiness probe
    #[error("worker {0} failed its readiness probe")]
    WorkerNotReady(WorkerId),

    /// The worker was stopped before it became ready
    #[error("worker {0} was terminated")]
    WorkerTerminated(WorkerId),

    /// Driver error
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The pool is shutting down or has shut down
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// Invalid configuration
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Error delivered to the submitter of a job
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The driver failed to execute the job
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The worker running the job was stopped or found unhealthy
    #[error("worker {0} was terminated while running the job")]
    WorkerTerminated(WorkerId),

    /// The queue is at its configured maximum length
    #[error("job queue is full ({max} jobs)")]
    QueueFull { max: usize },

    /// The job was cancelled by its submitter
    #[error("job was cancelled")]
    Cancelled,

    /// The job did not finish within the configured timeout
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),

    /// The pool shut down before the job finished
    #[error("worker pool shut down before the job finished")]
    PoolShutdown,
}

/// Result alias for pool management operations
pub type Result<T> = std::result::Result<T, PoolError>;
