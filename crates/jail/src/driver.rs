//! WorkerDriver backed by jailed child processes

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use awap_pool::{DriverError, HealthStatus, JobPayload, JobResult, WorkerDriver, WorkerId};
use parking_lot::RwLock;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::JailConfig;
use crate::protocol::JailMessage;

/// Pipes to one worker; held for the duration of an exchange
struct JailIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl JailIo {
    async fn send(&mut self, message: &JailMessage) -> Result<(), DriverError> {
        let line = message.encode()?;
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Next message, or `WorkerCrashed` once the worker closed stdout
    async fn receive(&mut self, worker: &WorkerId) -> Result<JailMessage, DriverError> {
        loop {
            let line = self
                .stdout
                .next_line()
                .await?
                .ok_or_else(|| DriverError::WorkerCrashed(format!("{worker} closed its stdout")))?;
            if line.trim().is_empty() {
                continue;
            }
            return JailMessage::decode(&line);
        }
    }
}

struct JailProcess {
    child: Mutex<Child>,
    io: Mutex<JailIo>,
}

impl JailProcess {
    /// Exit status if the process has already exited
    async fn exited(&self) -> Result<Option<std::process::ExitStatus>, DriverError> {
        Ok(self.child.lock().await.try_wait()?)
    }
}

/// Runs each worker as a child process speaking [`JailMessage`]s
///
/// Every worker gets its own process built from [`JailConfig`]. Jobs are
/// written to the process's stdin and answered on its stdout; one job runs
/// per process at a time.
pub struct ProcessDriver {
    config: JailConfig,
    workers: RwLock<HashMap<WorkerId, Arc<JailProcess>>>,
}

impl ProcessDriver {
    pub fn new(config: JailConfig) -> Self {
        Self {
            config,
            workers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &JailConfig {
        &self.config
    }

    /// Number of processes the driver is tracking
    pub fn process_count(&self) -> usize {
        self.workers.read().len()
    }

    fn process(&self, worker: &WorkerId) -> Result<Arc<JailProcess>, DriverError> {
        self.workers
            .read()
            .get(worker)
            .cloned()
            .ok_or_else(|| DriverError::WorkerNotFound(worker.clone()))
    }

    async fn run_job(
        &self,
        worker: &WorkerId,
        process: &JailProcess,
        input: JobPayload,
    ) -> Result<JobResult, DriverError> {
        let request_id = Uuid::now_v7().to_string();
        let mut io = process.io.lock().await;
        io.send(&JailMessage::Execute {
            request_id: request_id.clone(),
            input,
        })
        .await
        .map_err(|e| crashed_on_io(worker, e))?;

        loop {
            match io.receive(worker).await.map_err(|e| crashed_on_io(worker, e))? {
                JailMessage::Result {
                    request_id: id,
                    output,
                } if id == request_id => return Ok(output),
                JailMessage::Error {
                    request_id: id,
                    message,
                } if id.as_deref().map_or(true, |id| id == request_id) => {
                    return Err(DriverError::Execution(message))
                }
                other => debug!(worker_id = %worker, message = ?other, "Skipping unrelated message"),
            }
        }
    }

    async fn ping(&self, worker: &WorkerId, io: &mut JailIo) -> Result<(), DriverError> {
        io.send(&JailMessage::ping()).await?;
        loop {
            match io.receive(worker).await? {
                JailMessage::Pong { .. } => return Ok(()),
                JailMessage::Error {
                    request_id: None,
                    message,
                } => return Err(DriverError::Execution(message)),
                other => debug!(worker_id = %worker, message = ?other, "Skipping message while waiting for pong"),
            }
        }
    }
}

/// A broken pipe mid-exchange means the worker is gone
fn crashed_on_io(worker: &WorkerId, err: DriverError) -> DriverError {
    match err {
        DriverError::Io(e) => DriverError::WorkerCrashed(format!("{worker}: {e}")),
        other => other,
    }
}

#[async_trait]
impl WorkerDriver for ProcessDriver {
    #[instrument(skip_all, fields(command = %self.config.command))]
    async fn create(&self) -> Result<WorkerId, DriverError> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("{}: {e}", self.config.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Spawn("stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DriverError::Spawn("stdout was not captured".into()))?;

        let id = WorkerId::new(format!("jail-{}", Uuid::now_v7()));
        info!(worker_id = %id, pid = ?child.id(), "Spawned jail process");

        let process = JailProcess {
            child: Mutex::new(child),
            io: Mutex::new(JailIo {
                stdin,
                stdout: BufReader::new(stdout).lines(),
            }),
        };
        self.workers.write().insert(id.clone(), Arc::new(process));
        Ok(id)
    }

    #[instrument(skip_all, fields(worker_id = %worker))]
    async fn destroy(&self, worker: &WorkerId) -> Result<(), DriverError> {
        let process = self.process(worker)?;

        // A busy worker holds its pipes; it gets killed after the grace period
        if let Ok(mut io) = process.io.try_lock() {
            if let Err(e) = io.send(&JailMessage::Shutdown).await {
                debug!(error = %e, "Could not deliver shutdown message");
            }
        }

        let mut child = process.child.lock().await;
        match tokio::time::timeout(self.config.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => debug!(%status, "Jail process exited"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                warn!(grace = ?self.config.shutdown_grace, "Jail process ignored shutdown, killing");
                child.kill().await?;
            }
        }
        drop(child);

        self.workers.write().remove(worker);
        info!("Jail process stopped");
        Ok(())
    }

    #[instrument(skip_all, fields(worker_id = %worker))]
    async fn execute(
        &self,
        worker: &WorkerId,
        payload: JobPayload,
    ) -> Result<JobResult, DriverError> {
        let process = self.process(worker)?;
        let job = self.run_job(worker, &process, payload);

        match self.config.execute_timeout {
            Some(limit) => tokio::time::timeout(limit, job)
                .await
                .map_err(|_| DriverError::Timeout(limit))?,
            None => job.await,
        }
    }

    #[instrument(skip_all, fields(worker_id = %worker))]
    async fn health(&self, worker: &WorkerId) -> Result<HealthStatus, DriverError> {
        let process = self.process(worker)?;

        if let Some(status) = process.exited().await? {
            warn!(%status, "Jail process has exited");
            return Ok(HealthStatus::Unhealthy);
        }

        // Mid-job workers cannot answer a ping; a running process counts as alive
        let Ok(mut io) = process.io.try_lock() else {
            return Ok(HealthStatus::Alive);
        };

        let limit = self.config.ping_timeout;
        match tokio::time::timeout(limit, self.ping(worker, &mut io)).await {
            Ok(Ok(())) => Ok(HealthStatus::Alive),
            Ok(Err(e)) => {
                warn!(error = %e, "Ping failed");
                Ok(HealthStatus::Unhealthy)
            }
            Err(_) => Err(DriverError::Timeout(limit)),
        }
    }
}

impl std::fmt::Debug for ProcessDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDriver")
            .field("command", &self.config.command)
            .field("processes", &self.process_count())
            .finish()
    }
}
