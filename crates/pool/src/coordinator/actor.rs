//! Coordinator actor
//!
//! Owns [`PoolState`] and is the only code that touches it. Commands from
//! [`WorkerPool`](super::WorkerPool) handles and events from driver tasks are
//! handled one at a time; driver calls themselves always run on spawned tasks
//! so a slow create or a long job never stalls the loop.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::queue::{JobId, PendingJob};
use super::state::{
    Cancellation, Completion, Dispatch, HealthReport, PoolState, StartReply, WorkerHealth,
    WorkerInfo, WorkerStatus,
};
use crate::config::PoolConfig;
use crate::driver::{HealthStatus, JobResult, WorkerDriver, WorkerId};
use crate::error::{DriverError, JobError, PoolError};

/// Requests sent by pool handles
pub(crate) enum Command {
    StartWorker {
        reply: StartReply,
    },
    StopWorker {
        id: WorkerId,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Submit {
        job: PendingJob,
    },
    Cancel {
        job_id: JobId,
    },
    ListWorkers {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    QueueLen {
        reply: oneshot::Sender<usize>,
    },
    HealthCheck {
        reply: oneshot::Sender<HealthReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results posted back by driver tasks
enum Event {
    Created {
        result: Result<WorkerId, DriverError>,
        waiter: Option<StartReply>,
    },
    ReadinessProbed {
        worker: WorkerId,
        result: Result<HealthStatus, DriverError>,
    },
    Destroyed {
        worker: WorkerId,
        result: Result<(), DriverError>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    },
    Executed {
        worker: WorkerId,
        job_id: JobId,
        result: Result<JobResult, DriverError>,
    },
    HealthProbed {
        results: Vec<(WorkerId, Result<HealthStatus, DriverError>)>,
        reply: oneshot::Sender<HealthReport>,
    },
    ShutdownDestroyed {
        worker: WorkerId,
        result: Result<(), DriverError>,
    },
}

struct ShutdownProgress {
    pending_destroys: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

/// Single-writer owner of the pool state
pub(crate) struct Coordinator {
    driver: Arc<dyn WorkerDriver>,
    config: PoolConfig,
    state: PoolState,
    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    shutdown: Option<ShutdownProgress>,
}

impl Coordinator {
    pub fn new(
        driver: Arc<dyn WorkerDriver>,
        config: PoolConfig,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            driver,
            state: PoolState::new(config.capacity, config.max_queue_len),
            config,
            commands,
            commands_open: true,
            events_tx,
            events,
            shutdown: None,
        }
    }

    /// Run until shutdown completes
    pub async fn run(mut self) {
        info!(
            capacity = self.config.capacity,
            max_queue_len = ?self.config.max_queue_len,
            "Pool coordinator started"
        );

        loop {
            if let Some(progress) = &self.shutdown {
                if progress.pending_destroys == 0 && self.state.reserved() == 0 {
                    break;
                }
            }

            tokio::select! {
                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.commands_open = false;
                        if self.shutdown.is_none() {
                            debug!("All pool handles dropped");
                            self.begin_shutdown(None);
                        }
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
            }
        }

        self.commands.close();
        if let Some(progress) = self.shutdown.take() {
            for waiter in progress.waiters {
                let _ = waiter.send(());
            }
        }
        info!("Pool coordinator stopped");
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        if self.shutdown.is_some() {
            self.reject_command(command);
            return;
        }

        match command {
            Command::StartWorker { reply } => match self.state.reserve_slot() {
                Ok(()) => self.spawn_create(Some(reply)),
                Err(e) => {
                    debug!(error = %e, "Rejecting worker start");
                    let _ = reply.send(Err(e));
                }
            },
            Command::StopWorker { id, reply } => {
                if self.state.begin_stop(&id) {
                    self.spawn_destroy(id, reply);
                } else {
                    let _ = reply.send(Err(PoolError::WorkerNotFound(id)));
                }
            }
            Command::Submit { job } => {
                let job_id = job.id;
                match self.state.submit(job) {
                    Some(dispatch) => self.spawn_execute(dispatch),
                    None => debug!(%job_id, queued = self.state.queue_len(), "Job not dispatched"),
                }
            }
            Command::Cancel { job_id } => match self.state.cancel(job_id) {
                Cancellation::Dequeued => info!(%job_id, "Queued job cancelled"),
                Cancellation::Abandoned => {
                    info!(%job_id, "Running job abandoned, result will be discarded")
                }
                Cancellation::NotFound => debug!(%job_id, "Cancel for unknown job"),
            },
            Command::ListWorkers { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            Command::QueueLen { reply } => {
                let _ = reply.send(self.state.queue_len());
            }
            Command::HealthCheck { reply } => {
                let targets = self.state.probe_targets();
                self.spawn_health_probes(targets, reply);
            }
            Command::Shutdown { reply } => self.begin_shutdown(Some(reply)),
        }
    }

    fn reject_command(&mut self, command: Command) {
        match command {
            Command::StartWorker { reply } => {
                let _ = reply.send(Err(PoolError::ShuttingDown));
            }
            Command::StopWorker { reply, .. } => {
                let _ = reply.send(Err(PoolError::ShuttingDown));
            }
            Command::Submit { job } => job.resolve(Err(JobError::PoolShutdown)),
            Command::Cancel { .. } => {}
            Command::ListWorkers { reply } => {
                let _ = reply.send(Vec::new());
            }
            Command::QueueLen { reply } => {
                let _ = reply.send(0);
            }
            Command::HealthCheck { reply } => {
                let _ = reply.send(self.report(Vec::new()));
            }
            Command::Shutdown { reply } => self.begin_shutdown(Some(reply)),
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Created { result, waiter } => self.on_created(result, waiter),
            Event::ReadinessProbed { worker, result } => self.on_readiness(worker, result),
            Event::Destroyed {
                worker,
                result,
                reply,
            } => self.on_destroyed(worker, result, reply),
            Event::Executed {
                worker,
                job_id,
                result,
            } => self.on_executed(worker, job_id, result),
            Event::HealthProbed { results, reply } => self.on_health_probed(results, reply),
            Event::ShutdownDestroyed { worker, result } => {
                if let Err(e) = result {
                    warn!(worker_id = %worker, error = %e, "Failed to destroy worker during shutdown");
                }
                if let Some(progress) = &mut self.shutdown {
                    progress.pending_destroys = progress.pending_destroys.saturating_sub(1);
                }
            }
        }
    }

    fn on_created(&mut self, result: Result<WorkerId, DriverError>, waiter: Option<StartReply>) {
        match result {
            Ok(worker) if self.shutdown.is_some() => {
                self.state.release_slot();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(PoolError::ShuttingDown));
                }
                self.spawn_shutdown_destroy(worker);
            }
            Ok(worker) => {
                debug!(worker_id = %worker, "Worker created, probing readiness");
                self.state.insert_starting(worker.clone(), waiter);
                self.spawn_readiness_probe(worker);
            }
            Err(e) => {
                self.state.release_slot();
                match waiter {
                    Some(waiter) => {
                        warn!(error = %e, "Failed to create worker");
                        let _ = waiter.send(Err(PoolError::Driver(e)));
                    }
                    None => error!(
                        error = %e,
                        workers = self.state.worker_count(),
                        capacity = self.state.capacity(),
                        "Replacement worker could not be created, pool running below capacity"
                    ),
                }
            }
        }
    }

    fn on_readiness(&mut self, worker: WorkerId, result: Result<HealthStatus, DriverError>) {
        if self.state.status_of(&worker) != Some(WorkerStatus::Starting) {
            debug!(worker_id = %worker, "Readiness result for a worker no longer starting");
            return;
        }

        match result {
            Ok(HealthStatus::Alive) => {
                info!(worker_id = %worker, "Worker ready");
                if let Some(dispatch) = self.state.mark_ready(&worker) {
                    self.spawn_execute(dispatch);
                }
            }
            Ok(HealthStatus::Unhealthy) => {
                warn!(worker_id = %worker, "Worker failed readiness probe");
                self.state
                    .fail_readiness(&worker, PoolError::WorkerNotReady(worker.clone()));
                self.spawn_discard(worker);
            }
            Err(e) => {
                warn!(worker_id = %worker, error = %e, "Worker readiness probe errored");
                self.state.fail_readiness(&worker, PoolError::Driver(e));
                self.spawn_discard(worker);
            }
        }
    }

    fn on_destroyed(
        &mut self,
        worker: WorkerId,
        result: Result<(), DriverError>,
        reply: oneshot::Sender<Result<(), PoolError>>,
    ) {
        match result {
            Ok(()) => {
                if let Some(status) = self.state.remove_worker(&worker) {
                    info!(worker_id = %worker, %status, "Worker stopped");
                }
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(worker_id = %worker, error = %e, "Failed to destroy worker, keeping it");
                if let Some(dispatch) = self.state.abort_stop(&worker) {
                    self.spawn_execute(dispatch);
                }
                let _ = reply.send(Err(PoolError::Driver(e)));
            }
        }
    }

    fn on_executed(
        &mut self,
        worker: WorkerId,
        job_id: JobId,
        result: Result<JobResult, DriverError>,
    ) {
        if let Err(e) = &result {
            warn!(worker_id = %worker, %job_id, error = %e, "Job failed");
        } else {
            debug!(worker_id = %worker, %job_id, "Job completed");
        }

        let reason = result.as_ref().err().map(ToString::to_string);
        match self.state.complete(&worker, job_id, result) {
            Completion::Released(Some(dispatch)) => self.spawn_execute(dispatch),
            Completion::Released(None) => {}
            Completion::WorkerLost => {
                let reason = reason.unwrap_or_default();
                self.replace_worker(&worker, &reason);
            }
            Completion::Discarded => {
                debug!(worker_id = %worker, %job_id, "Discarding result for untracked job")
            }
        }
    }

    fn on_health_probed(
        &mut self,
        results: Vec<(WorkerId, Result<HealthStatus, DriverError>)>,
        reply: oneshot::Sender<HealthReport>,
    ) {
        let mut workers = Vec::with_capacity(results.len());

        for (worker, result) in results {
            let Some(status) = self.state.status_of(&worker) else {
                continue;
            };
            match result {
                Ok(HealthStatus::Alive) => workers.push(WorkerHealth {
                    id: worker,
                    status,
                    health: HealthStatus::Alive,
                    error: None,
                }),
                unhealthy => {
                    let error = unhealthy.err().map(|e| e.to_string());
                    self.replace_worker(&worker, error.as_deref().unwrap_or("health probe failed"));
                    workers.push(WorkerHealth {
                        id: worker,
                        status: WorkerStatus::Unhealthy,
                        health: HealthStatus::Unhealthy,
                        error,
                    });
                }
            }
        }

        let report = self.report(workers);
        debug!(
            workers = report.worker_count,
            queued = report.queued_count,
            unhealthy = report.unhealthy().count(),
            "Health check finished"
        );
        let _ = reply.send(report);
    }

    fn report(&self, workers: Vec<WorkerHealth>) -> HealthReport {
        HealthReport {
            worker_count: self.state.worker_count(),
            capacity: self.state.capacity(),
            queued_count: self.state.queue_len(),
            workers,
        }
    }

    /// Failure path: drop the worker now, destroy it in the background and
    /// start a replacement if configured
    fn replace_worker(&mut self, worker: &WorkerId, reason: &str) {
        if self.state.is_stopping(worker) {
            debug!(
                worker_id = %worker,
                reason,
                "Worker failed while stopping, leaving it to its destroy"
            );
            return;
        }
        let Some(status) = self.state.remove_worker(worker) else {
            return;
        };
        warn!(worker_id = %worker, %status, reason, "Removing failed worker");
        self.spawn_discard(worker.clone());

        if !self.config.replace_unhealthy {
            return;
        }
        match self.state.reserve_slot() {
            Ok(()) => {
                info!(failed_worker = %worker, "Starting replacement worker");
                self.spawn_create(None);
            }
            Err(e) => warn!(error = %e, "Cannot start replacement worker"),
        }
    }

    fn begin_shutdown(&mut self, waiter: Option<oneshot::Sender<()>>) {
        if let Some(progress) = &mut self.shutdown {
            progress.waiters.extend(waiter);
            return;
        }

        let workers = self.state.shutdown();
        info!(
            workers = workers.len(),
            pending_creates = self.state.reserved(),
            "Shutting down worker pool"
        );
        self.shutdown = Some(ShutdownProgress {
            pending_destroys: workers.len(),
            waiters: waiter.into_iter().collect(),
        });
        for worker in workers {
            self.spawn_destroy_for_shutdown(worker);
        }
    }

    // ------------------------------------------------------------------
    // Driver tasks
    // ------------------------------------------------------------------

    fn spawn_create(&self, waiter: Option<StartReply>) {
        let driver = Arc::clone(&self.driver);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = driver.create().await;
            let _ = events.send(Event::Created { result, waiter });
        });
    }

    fn spawn_readiness_probe(&self, worker: WorkerId) {
        let driver = Arc::clone(&self.driver);
        let events = self.events_tx.clone();
        let limit = self.config.health_probe_timeout;
        tokio::spawn(async move {
            let result = probe(driver.as_ref(), &worker, limit).await;
            let _ = events.send(Event::ReadinessProbed { worker, result });
        });
    }

    fn spawn_destroy(&self, worker: WorkerId, reply: oneshot::Sender<Result<(), PoolError>>) {
        let driver = Arc::clone(&self.driver);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = driver.destroy(&worker).await;
            let _ = events.send(Event::Destroyed {
                worker,
                result,
                reply,
            });
        });
    }

    /// Best-effort destroy of a worker that already left the pool
    fn spawn_discard(&self, worker: WorkerId) {
        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move {
            if let Err(e) = driver.destroy(&worker).await {
                warn!(worker_id = %worker, error = %e, "Best-effort destroy failed");
            }
        });
    }

    fn spawn_shutdown_destroy(&mut self, worker: WorkerId) {
        if let Some(progress) = &mut self.shutdown {
            progress.pending_destroys += 1;
        }
        self.spawn_destroy_for_shutdown(worker);
    }

    fn spawn_destroy_for_shutdown(&self, worker: WorkerId) {
        let driver = Arc::clone(&self.driver);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = driver.destroy(&worker).await;
            let _ = events.send(Event::ShutdownDestroyed { worker, result });
        });
    }

    fn spawn_execute(&self, dispatch: Dispatch) {
        let Dispatch {
            worker,
            job_id,
            payload,
        } = dispatch;
        debug!(worker_id = %worker, %job_id, "Dispatching job");

        let driver = Arc::clone(&self.driver);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = driver.execute(&worker, payload).await;
            let _ = events.send(Event::Executed {
                worker,
                job_id,
                result,
            });
        });
    }

    fn spawn_health_probes(&self, targets: Vec<WorkerId>, reply: oneshot::Sender<HealthReport>) {
        let driver = Arc::clone(&self.driver);
        let events = self.events_tx.clone();
        let limit = self.config.health_probe_timeout;
        tokio::spawn(async move {
            let probes = targets.into_iter().map(|worker| {
                let driver = Arc::clone(&driver);
                async move {
                    let result = probe(driver.as_ref(), &worker, limit).await;
                    (worker, result)
                }
            });
            let results = join_all(probes).await;
            let _ = events.send(Event::HealthProbed { results, reply });
        });
    }
}

async fn probe(
    driver: &dyn WorkerDriver,
    worker: &WorkerId,
    limit: Duration,
) -> Result<HealthStatus, DriverError> {
    match tokio::time::timeout(limit, driver.health(worker)).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(limit)),
    }
}
