//! Pool state machine
//!
//! Plain synchronous state owned by the coordinator task. Every method is a
//! single decision: it mutates the worker map or queue and, when a job should
//! start, hands back a [`Dispatch`] for the caller to run on the driver.
//! Nothing in here awaits or talks to the driver.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use super::queue::{JobId, JobReply, PendingJob, RequestQueue};
use crate::driver::{HealthStatus, JobPayload, JobResult, WorkerId};
use crate::error::{DriverError, JobError, PoolError};

/// Channel a `start_worker` caller waits on until its worker is ready
pub(crate) type StartReply = oneshot::Sender<Result<WorkerId, PoolError>>;

/// Lifecycle status of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Created by the driver, readiness not yet confirmed
    Starting,
    /// Idle and eligible for dispatch
    Ready,
    /// Running exactly one job
    Processing,
    /// Failed a health probe; removed from the pool
    Unhealthy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Ready => write!(f, "ready"),
            Self::Processing => write!(f, "processing"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// Health of one worker as seen by a health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub health: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate result of a health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Workers in the pool after failed ones were removed
    pub worker_count: usize,
    pub capacity: usize,
    pub queued_count: usize,
    pub workers: Vec<WorkerHealth>,
}

impl HealthReport {
    /// Workers that failed this check
    pub fn unhealthy(&self) -> impl Iterator<Item = &WorkerHealth> {
        self.workers
            .iter()
            .filter(|w| w.health == HealthStatus::Unhealthy)
    }

    /// Number of free slots below capacity
    pub fn missing_workers(&self) -> usize {
        self.capacity.saturating_sub(self.worker_count)
    }
}

/// A job that should start on a worker now
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dispatch {
    pub worker: WorkerId,
    pub job_id: JobId,
    pub payload: JobPayload,
}

/// What happened when a driver execution came back
#[derive(Debug, PartialEq)]
pub(crate) enum Completion {
    /// Worker is free again; carries the queue head if one was waiting
    Released(Option<Dispatch>),
    /// The driver error means the worker is gone and must be replaced
    WorkerLost,
    /// The worker or job is no longer tracked; the result was dropped
    Discarded,
}

/// Result of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Cancellation {
    /// Removed from the queue before it ran
    Dequeued,
    /// Already running; its result will be discarded
    Abandoned,
    /// Finished or never known
    NotFound,
}

struct WorkerRecord {
    id: WorkerId,
    status: WorkerStatus,
    started_at: DateTime<Utc>,
    jobs_completed: u64,
    jobs_failed: u64,
    /// Logical time the worker last became ready; lower is served first
    released_at: u64,
    /// A destroy call is in flight
    stopping: bool,
}

impl WorkerRecord {
    fn is_selectable(&self) -> bool {
        self.status == WorkerStatus::Ready && !self.stopping
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            status: self.status,
            started_at: self.started_at,
            jobs_completed: self.jobs_completed,
            jobs_failed: self.jobs_failed,
        }
    }
}

struct InFlight {
    job_id: JobId,
    /// None once the submitter has cancelled
    reply: Option<JobReply>,
}

/// Worker map, queue and in-flight bookkeeping
pub(crate) struct PoolState {
    capacity: usize,
    workers: HashMap<WorkerId, WorkerRecord>,
    /// Create calls in flight; they hold a slot until they resolve
    reserved: usize,
    queue: RequestQueue,
    in_flight: HashMap<WorkerId, InFlight>,
    start_waiters: HashMap<WorkerId, StartReply>,
    clock: u64,
}

impl PoolState {
    pub fn new(capacity: usize, max_queue_len: Option<usize>) -> Self {
        Self {
            capacity,
            workers: HashMap::new(),
            reserved: 0,
            queue: RequestQueue::new(max_queue_len),
            in_flight: HashMap::new(),
            start_waiters: HashMap::new(),
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn status_of(&self, id: &WorkerId) -> Option<WorkerStatus> {
        self.workers.get(id).map(|w| w.status)
    }

    // ------------------------------------------------------------------
    // Worker lifecycle
    // ------------------------------------------------------------------

    /// Claim a slot for a create call, failing when the pool is full
    pub fn reserve_slot(&mut self) -> Result<(), PoolError> {
        if self.workers.len() + self.reserved >= self.capacity {
            return Err(PoolError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        self.reserved += 1;
        Ok(())
    }

    /// Give back a slot whose create call failed
    pub fn release_slot(&mut self) {
        self.reserved = self.reserved.saturating_sub(1);
    }

    /// Record a worker the driver just created
    pub fn insert_starting(&mut self, id: WorkerId, waiter: Option<StartReply>) {
        self.release_slot();
        self.workers.insert(
            id.clone(),
            WorkerRecord {
                id: id.clone(),
                status: WorkerStatus::Starting,
                started_at: Utc::now(),
                jobs_completed: 0,
                jobs_failed: 0,
                released_at: 0,
                stopping: false,
            },
        );
        if let Some(waiter) = waiter {
            self.start_waiters.insert(id, waiter);
        }
    }

    /// Readiness confirmed: the worker joins the pool and takes the queue head
    pub fn mark_ready(&mut self, id: &WorkerId) -> Option<Dispatch> {
        let clock = self.tick();
        let record = self.workers.get_mut(id)?;
        if record.status != WorkerStatus::Starting {
            return None;
        }
        record.status = WorkerStatus::Ready;
        record.released_at = clock;

        if let Some(waiter) = self.start_waiters.remove(id) {
            let _ = waiter.send(Ok(id.clone()));
        }
        self.drain_into(id)
    }

    /// Readiness probe failed: drop the record and fail the starter
    pub fn fail_readiness(&mut self, id: &WorkerId, err: PoolError) -> bool {
        if self.workers.remove(id).is_none() {
            return false;
        }
        if let Some(waiter) = self.start_waiters.remove(id) {
            let _ = waiter.send(Err(err));
        }
        true
    }

    /// Flag a worker as being stopped; false if unknown or already stopping
    pub fn begin_stop(&mut self, id: &WorkerId) -> bool {
        match self.workers.get_mut(id) {
            Some(record) if !record.stopping => {
                record.stopping = true;
                true
            }
            _ => false,
        }
    }

    /// Whether a destroy call is in flight for this worker
    pub fn is_stopping(&self, id: &WorkerId) -> bool {
        self.workers.get(id).is_some_and(|w| w.stopping)
    }

    /// Destroy failed: the worker stays and may take the queue head
    pub fn abort_stop(&mut self, id: &WorkerId) -> Option<Dispatch> {
        let record = self.workers.get_mut(id)?;
        record.stopping = false;
        self.drain_into(id)
    }

    /// Remove a worker, failing whatever was waiting on it
    ///
    /// Its in-flight job (if any) is answered with `WorkerTerminated`; a late
    /// driver completion for it is discarded because the worker is unknown.
    pub fn remove_worker(&mut self, id: &WorkerId) -> Option<WorkerStatus> {
        let record = self.workers.remove(id)?;

        if let Some(in_flight) = self.in_flight.remove(id) {
            if let Some(reply) = in_flight.reply {
                let _ = reply.send(Err(JobError::WorkerTerminated(id.clone())));
            }
        }
        if let Some(waiter) = self.start_waiters.remove(id) {
            let _ = waiter.send(Err(PoolError::WorkerTerminated(id.clone())));
        }
        Some(record.status)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Hand a job to a ready worker, or queue it
    pub fn submit(&mut self, job: PendingJob) -> Option<Dispatch> {
        if let Some(worker) = self.select_ready() {
            return Some(self.assign(worker, job));
        }

        match self.queue.push(job) {
            Ok(position) => {
                debug!(queue_len = position, "No ready worker, job queued");
                None
            }
            Err(job) => {
                let max = self.queue.max_len().unwrap_or_default();
                job.resolve(Err(JobError::QueueFull { max }));
                None
            }
        }
    }

    /// A driver execution returned
    pub fn complete(
        &mut self,
        worker: &WorkerId,
        job_id: JobId,
        result: Result<JobResult, DriverError>,
    ) -> Completion {
        let matches = self
            .in_flight
            .get(worker)
            .is_some_and(|f| f.job_id == job_id);
        if !matches || !self.workers.contains_key(worker) {
            return Completion::Discarded;
        }

        let in_flight = match self.in_flight.remove(worker) {
            Some(in_flight) => in_flight,
            None => return Completion::Discarded,
        };
        let fatal = result.as_ref().err().is_some_and(DriverError::is_worker_fatal);
        let clock = self.tick();

        if let Some(record) = self.workers.get_mut(worker) {
            match &result {
                Ok(_) => record.jobs_completed += 1,
                Err(_) => record.jobs_failed += 1,
            }
            record.status = WorkerStatus::Ready;
            record.released_at = clock;
        }

        if let Some(reply) = in_flight.reply {
            let _ = reply.send(result.map_err(JobError::Driver));
        }

        if fatal {
            return Completion::WorkerLost;
        }
        Completion::Released(self.drain_into(worker))
    }

    /// Cancel a queued or running job
    pub fn cancel(&mut self, job_id: JobId) -> Cancellation {
        if let Some(entry) = self.queue.remove(job_id) {
            entry.job.resolve(Err(JobError::Cancelled));
            return Cancellation::Dequeued;
        }

        for in_flight in self.in_flight.values_mut() {
            if in_flight.job_id != job_id {
                continue;
            }
            if let Some(reply) = in_flight.reply.take() {
                let _ = reply.send(Err(JobError::Cancelled));
                return Cancellation::Abandoned;
            }
        }
        Cancellation::NotFound
    }

    /// Least recently released selectable worker, ties broken by id
    fn select_ready(&self) -> Option<WorkerId> {
        self.workers
            .values()
            .filter(|w| w.is_selectable())
            .min_by(|a, b| a.released_at.cmp(&b.released_at).then_with(|| a.id.cmp(&b.id)))
            .map(|w| w.id.clone())
    }

    fn assign(&mut self, worker: WorkerId, job: PendingJob) -> Dispatch {
        if let Some(record) = self.workers.get_mut(&worker) {
            record.status = WorkerStatus::Processing;
        }
        self.in_flight.insert(
            worker.clone(),
            InFlight {
                job_id: job.id,
                reply: Some(job.reply),
            },
        );
        Dispatch {
            worker,
            job_id: job.id,
            payload: job.payload,
        }
    }

    /// Give the queue head to this worker if it is free
    fn drain_into(&mut self, worker: &WorkerId) -> Option<Dispatch> {
        if !self.workers.get(worker)?.is_selectable() {
            return None;
        }
        let entry = self.queue.pop_live()?;
        debug!(
            worker_id = %worker,
            job_id = %entry.job.id,
            waited_ms = (Utc::now() - entry.enqueued_at).num_milliseconds(),
            "Dispatching queued job"
        );
        Some(self.assign(worker.clone(), entry.job))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    /// Workers a health check should probe
    pub fn probe_targets(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| {
                !w.stopping
                    && matches!(w.status, WorkerStatus::Ready | WorkerStatus::Processing)
            })
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.workers.values().map(WorkerRecord::info).collect();
        infos.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Fail every waiter and hand back all worker ids for destruction
    pub fn shutdown(&mut self) -> Vec<WorkerId> {
        for entry in self.queue.drain() {
            entry.job.resolve(Err(JobError::PoolShutdown));
        }
        for (_, in_flight) in self.in_flight.drain() {
            if let Some(reply) = in_flight.reply {
                let _ = reply.send(Err(JobError::PoolShutdown));
            }
        }
        for (_, waiter) in self.start_waiters.drain() {
            let _ = waiter.send(Err(PoolError::ShuttingDown));
        }
        let mut ids: Vec<WorkerId> = self.workers.drain().map(|(id, _)| id).collect();
        ids.sort();
        ids
    }
}
