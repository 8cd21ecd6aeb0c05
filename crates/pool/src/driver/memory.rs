//! In-memory implementation of WorkerDriver for testing

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;
use tokio::sync::Semaphore;

use super::{HealthStatus, JobPayload, JobResult, WorkerDriver, WorkerId};
use crate::error::DriverError;

/// Internal driver state
#[derive(Default)]
struct DriverState {
    live: BTreeSet<WorkerId>,
    unhealthy: HashSet<WorkerId>,
    failing_destroys: HashSet<WorkerId>,
    create_failures: u32,
    born_unhealthy: u32,
    executions: Vec<(WorkerId, JobPayload)>,
    created: u64,
    destroy_requests: u64,
    destroyed: u64,
}

/// In-memory implementation of WorkerDriver
///
/// Workers are plain ids; executing a job echoes the payload back. Failures
/// are scripted through the `fail_*` and `set_*` methods, and the payload
/// itself can ask for one:
///
/// - `{"fail": "reason"}` fails the job with [`DriverError::Execution`]
/// - `{"crash": true}` fails it with [`DriverError::WorkerCrashed`]
/// - `{"delay_ms": 50}` sleeps before answering
///
/// A gated driver holds every execution until [`release_jobs`](Self::release_jobs)
/// lets it through, which makes "all workers busy" states easy to set up.
/// [`with_held_destroys`](Self::with_held_destroys) does the same for destroy
/// calls, keeping a worker in its stopping state.
///
/// # Example
///
/// ```
/// use awap_pool::InMemoryDriver;
///
/// let driver = InMemoryDriver::gated();
/// driver.fail_next_creates(1);
/// ```
pub struct InMemoryDriver {
    state: RwLock<DriverState>,
    next_id: AtomicU64,
    gate: Option<Arc<Semaphore>>,
    destroy_gate: Option<Arc<Semaphore>>,
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDriver {
    /// Create a driver whose executions complete immediately
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DriverState::default()),
            next_id: AtomicU64::new(1),
            gate: None,
            destroy_gate: None,
        }
    }

    /// Create a driver whose executions wait for [`release_jobs`](Self::release_jobs)
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    /// Let `n` waiting (or future) executions finish
    pub fn release_jobs(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Hold every destroy call until [`release_destroys`](Self::release_destroys)
    pub fn with_held_destroys(mut self) -> Self {
        self.destroy_gate = Some(Arc::new(Semaphore::new(0)));
        self
    }

    /// Let `n` held (or future) destroy calls proceed
    pub fn release_destroys(&self, n: usize) {
        if let Some(gate) = &self.destroy_gate {
            gate.add_permits(n);
        }
    }

    /// Make the next `n` create calls fail
    pub fn fail_next_creates(&self, n: u32) {
        self.state.write().create_failures += n;
    }

    /// Make the next `n` created workers report unhealthy from the start
    pub fn create_unhealthy(&self, n: u32) {
        self.state.write().born_unhealthy += n;
    }

    /// Make the next destroy call for this worker fail
    pub fn fail_destroy(&self, worker: &WorkerId) {
        self.state.write().failing_destroys.insert(worker.clone());
    }

    /// Mark a worker as unhealthy for subsequent health probes
    pub fn set_unhealthy(&self, worker: &WorkerId) {
        self.state.write().unhealthy.insert(worker.clone());
    }

    /// Workers that have been created and not destroyed
    pub fn live_workers(&self) -> Vec<WorkerId> {
        self.state.read().live.iter().cloned().collect()
    }

    /// Every execution in the order it started
    pub fn executions(&self) -> Vec<(WorkerId, JobPayload)> {
        self.state.read().executions.clone()
    }

    /// Number of executions started so far
    pub fn execution_count(&self) -> usize {
        self.state.read().executions.len()
    }

    /// Number of successful create calls
    pub fn created_count(&self) -> u64 {
        self.state.read().created
    }

    /// Number of destroy calls received, including held and failed ones
    pub fn destroy_requests(&self) -> u64 {
        self.state.read().destroy_requests
    }

    /// Number of successful destroy calls
    pub fn destroyed_count(&self) -> u64 {
        self.state.read().destroyed
    }

    fn ensure_live(&self, worker: &WorkerId) -> Result<(), DriverError> {
        if self.state.read().live.contains(worker) {
            Ok(())
        } else {
            Err(DriverError::WorkerNotFound(worker.clone()))
        }
    }
}

#[async_trait]
impl WorkerDriver for InMemoryDriver {
    async fn create(&self) -> Result<WorkerId, DriverError> {
        let mut state = self.state.write();
        if state.create_failures > 0 {
            state.create_failures -= 1;
            return Err(DriverError::Spawn("scripted create failure".into()));
        }

        let id = WorkerId::new(format!("mem-{}", self.next_id.fetch_add(1, Ordering::Relaxed)));
        if state.born_unhealthy > 0 {
            state.born_unhealthy -= 1;
            state.unhealthy.insert(id.clone());
        }
        state.live.insert(id.clone());
        state.created += 1;
        Ok(id)
    }

    async fn destroy(&self, worker: &WorkerId) -> Result<(), DriverError> {
        self.state.write().destroy_requests += 1;
        if let Some(gate) = &self.destroy_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| DriverError::Execution("destroy gate closed".into()))?;
            permit.forget();
        }

        let mut state = self.state.write();
        if state.failing_destroys.remove(worker) {
            return Err(DriverError::Execution(format!(
                "scripted destroy failure for {worker}"
            )));
        }
        if !state.live.remove(worker) {
            return Err(DriverError::WorkerNotFound(worker.clone()));
        }
        state.unhealthy.remove(worker);
        state.destroyed += 1;
        Ok(())
    }

    async fn execute(
        &self,
        worker: &WorkerId,
        payload: JobPayload,
    ) -> Result<JobResult, DriverError> {
        self.ensure_live(worker)?;
        self.state
            .write()
            .executions
            .push((worker.clone(), payload.clone()));

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| DriverError::WorkerCrashed("execution gate closed".into()))?;
            permit.forget();
        }

        if let Some(ms) = payload.get("delay_ms").and_then(|v| v.as_u64()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        // A worker destroyed mid-job never answers
        self.ensure_live(worker)
            .map_err(|_| DriverError::WorkerCrashed(format!("worker {worker} was destroyed")))?;

        if payload.get("crash").is_some() {
            return Err(DriverError::WorkerCrashed(format!(
                "worker {worker} crashed on request"
            )));
        }
        if let Some(reason) = payload.get("fail") {
            return Err(DriverError::Execution(reason.to_string()));
        }

        Ok(json!({ "worker": worker.as_str(), "input": payload }))
    }

    async fn health(&self, worker: &WorkerId) -> Result<HealthStatus, DriverError> {
        self.ensure_live(worker)?;
        if self.state.read().unhealthy.contains(worker) {
            Ok(HealthStatus::Unhealthy)
        } else {
            Ok(HealthStatus::Alive)
        }
    }
}
