//! Handles returned to job submitters

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::actor::Command;
use super::queue::JobId;
use crate::driver::JobResult;
use crate::error::JobError;

/// Claim on the result of a submitted job
///
/// Awaiting [`wait`](Self::wait) yields the job's single outcome. Dropping the
/// ticket without waiting gives the job up: if it is still queued it is
/// skipped when it reaches the head of the queue, and if it is already running
/// its result is thrown away.
#[derive(Debug)]
pub struct JobTicket {
    id: JobId,
    rx: oneshot::Receiver<Result<JobResult, JobError>>,
    commands: mpsc::Sender<Command>,
    timeout: Option<Duration>,
}

impl JobTicket {
    pub(crate) fn new(
        id: JobId,
        rx: oneshot::Receiver<Result<JobResult, JobError>>,
        commands: mpsc::Sender<Command>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            rx,
            commands,
            timeout,
        }
    }

    /// Id of the submitted job
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Get a handle that can cancel this job from elsewhere
    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle {
            job_id: self.id,
            commands: self.commands.clone(),
        }
    }

    /// Wait for the job's outcome
    ///
    /// When the pool was configured with a job timeout and it elapses first,
    /// the job is cancelled and [`JobError::TimedOut`] is returned.
    pub async fn wait(mut self) -> Result<JobResult, JobError> {
        let Some(limit) = self.timeout else {
            return (&mut self.rx).await.unwrap_or(Err(JobError::PoolShutdown));
        };

        match tokio::time::timeout(limit, &mut self.rx).await {
            Ok(outcome) => outcome.unwrap_or(Err(JobError::PoolShutdown)),
            Err(_) => {
                debug!(job_id = %self.id, timeout = ?limit, "Job timed out, cancelling");
                self.cancellation_handle().cancel();
                Err(JobError::TimedOut(limit))
            }
        }
    }

    /// Cancel the job and give up on its result
    pub fn cancel(self) {
        self.cancellation_handle().cancel();
    }
}

/// Handle for cancelling a job
///
/// Cancelling a queued job removes it from the queue and answers
/// [`JobError::Cancelled`]. A running job is answered with
/// [`JobError::Cancelled`] as well, but keeps its worker until the driver
/// returns; the late result is discarded.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    job_id: JobId,
    commands: mpsc::Sender<Command>,
}

impl CancellationHandle {
    /// Request cancellation
    ///
    /// Returns false when the request could not be delivered, which happens
    /// once the pool has shut down.
    pub fn cancel(&self) -> bool {
        self.commands
            .try_send(Command::Cancel {
                job_id: self.job_id,
            })
            .is_ok()
    }

    /// Id of the job this handle cancels
    pub fn job_id(&self) -> JobId {
        self.job_id
    }
}
