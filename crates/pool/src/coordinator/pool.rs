//! Public pool handle

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use uuid::Uuid;

use super::actor::{Command, Coordinator};
use super::queue::PendingJob;
use super::state::{HealthReport, WorkerInfo, WorkerStatus};
use super::ticket::JobTicket;
use crate::config::PoolConfig;
use crate::driver::{JobPayload, JobResult, WorkerDriver, WorkerId};
use crate::error::{JobError, PoolError, Result};

/// Handle to a running worker pool
///
/// Cloning is cheap; every clone talks to the same coordinator task. The
/// coordinator shuts down when [`shutdown`](Self::shutdown) is called or when
/// the last handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::Sender<Command>,
    config: Arc<PoolConfig>,
}

impl WorkerPool {
    /// Validate the configuration and spawn the coordinator
    ///
    /// Must be called from within a tokio runtime. The pool starts empty;
    /// use [`start_worker`](Self::start_worker) or
    /// [`fill_to_capacity`](Self::fill_to_capacity) to bring workers up.
    pub fn spawn(driver: Arc<dyn WorkerDriver>, config: PoolConfig) -> Result<Self> {
        config.validate()?;

        let (commands, rx) = mpsc::channel(config.command_buffer);
        let coordinator = Coordinator::new(driver, config.clone(), rx);
        tokio::spawn(coordinator.run());

        Ok(Self {
            commands,
            config: Arc::new(config),
        })
    }

    /// The configuration the pool was spawned with
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Create a worker and wait until it passes its readiness probe
    pub async fn start_worker(&self) -> Result<WorkerId> {
        self.request(|reply| Command::StartWorker { reply }).await?
    }

    /// Start workers until the pool is at capacity
    ///
    /// Starts run concurrently. Returns the ids of the new workers, or the
    /// first error if any start failed.
    pub async fn fill_to_capacity(&self) -> Result<Vec<WorkerId>> {
        let current = self.list_workers().await?.len();
        let missing = self.config.capacity.saturating_sub(current);
        if missing == 0 {
            return Ok(Vec::new());
        }

        info!(missing, capacity = self.config.capacity, "Filling worker pool");
        let starts = (0..missing).map(|_| self.start_worker());
        join_all(starts).await.into_iter().collect()
    }

    /// Destroy a worker
    ///
    /// A job running on the worker is answered with
    /// [`JobError::WorkerTerminated`]. If the driver fails to destroy the
    /// worker it stays in the pool and the error is returned.
    pub async fn stop_worker(&self, id: &WorkerId) -> Result<()> {
        let id = id.clone();
        self.request(|reply| Command::StopWorker { id, reply }).await?
    }

    /// Submit a job
    ///
    /// The job runs on the least recently used ready worker, or waits in the
    /// queue until one frees up. Rejections such as a full queue arrive
    /// through the returned ticket.
    pub async fn submit(&self, payload: JobPayload) -> Result<JobTicket> {
        let (reply, rx) = oneshot::channel();
        let job = PendingJob {
            id: Uuid::now_v7(),
            payload,
            reply,
        };
        let id = job.id;

        self.commands
            .send(Command::Submit { job })
            .await
            .map_err(|_| PoolError::ShuttingDown)?;

        Ok(JobTicket::new(
            id,
            rx,
            self.commands.clone(),
            self.config.job_timeout,
        ))
    }

    /// Submit a job and wait for its outcome
    pub async fn execute(&self, payload: JobPayload) -> std::result::Result<JobResult, JobError> {
        let ticket = self
            .submit(payload)
            .await
            .map_err(|_| JobError::PoolShutdown)?;
        ticket.wait().await
    }

    /// Snapshot of every worker in the pool, oldest first
    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>> {
        self.request(|reply| Command::ListWorkers { reply }).await
    }

    /// Number of workers currently in the given status
    pub async fn count_workers(&self, status: WorkerStatus) -> Result<usize> {
        let workers = self.list_workers().await?;
        Ok(workers.iter().filter(|w| w.status == status).count())
    }

    /// Number of jobs waiting for a worker
    pub async fn queue_len(&self) -> Result<usize> {
        self.request(|reply| Command::QueueLen { reply }).await
    }

    /// Probe every ready or busy worker
    ///
    /// Workers that fail their probe are removed (and replaced when the pool
    /// is configured to) before the report is returned.
    pub async fn health_check(&self) -> Result<HealthReport> {
        self.request(|reply| Command::HealthCheck { reply }).await
    }

    /// Shut the pool down and wait until every worker has been destroyed
    ///
    /// Queued and running jobs are answered with [`JobError::PoolShutdown`].
    /// Calling this on a pool that already shut down is a no-op.
    pub async fn shutdown(&self) -> Result<()> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Ok(()) | Err(PoolError::ShuttingDown) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Whether the coordinator has stopped
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| PoolError::ShuttingDown)?;
        rx.await.map_err(|_| PoolError::ShuttingDown)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.config.capacity)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}
