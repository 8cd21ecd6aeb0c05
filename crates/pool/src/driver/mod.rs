//! Worker driver contract
//!
//! This module provides:
//! - [`WorkerDriver`] trait implemented by whatever actually runs workers
//! - [`InMemoryDriver`] for testing
//!
//! Every driver call may be slow (process spawn, container startup, model
//! inference). The coordinator always invokes the driver from a spawned task,
//! so implementations are free to block their own future for as long as the
//! call takes.

mod memory;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use memory::InMemoryDriver;

use crate::error::DriverError;

/// Opaque job input handed to a worker
pub type JobPayload = serde_json::Value;

/// Opaque output produced by a worker
pub type JobResult = serde_json::Value;

/// Identifier assigned to a worker by its driver
///
/// Treated as an opaque string: the pool never assumes ordering or
/// monotonicity, and never reuses an id once the worker is removed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Result of a health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Worker is alive and responsive
    Alive,
    /// Worker is dead, wedged or otherwise unusable
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alive => write!(f, "alive"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Creates, destroys, executes work in, and health-checks isolated workers
#[async_trait]
pub trait WorkerDriver: Send + Sync + 'static {
    /// Create a new worker and return its id
    async fn create(&self) -> Result<WorkerId, DriverError>;

    /// Destroy a worker, releasing everything it holds
    async fn destroy(&self, worker: &WorkerId) -> Result<(), DriverError>;

    /// Run one job on the worker and wait for its output
    async fn execute(&self, worker: &WorkerId, payload: JobPayload)
        -> Result<JobResult, DriverError>;

    /// Probe whether the worker is alive and responsive
    async fn health(&self, worker: &WorkerId) -> Result<HealthStatus, DriverError>;
}
