//! # Worker Pool Coordinator
//!
//! A fixed-capacity pool of isolated workers that run grading jobs.
//!
//! ## Features
//!
//! - **Bounded capacity**: never more live workers than configured, counting starts still in flight
//! - **Fair dispatch**: jobs go to the least recently used ready worker; overflow waits in a FIFO queue
//! - **Health monitoring**: failed workers are removed and replaced automatically
//! - **Cancellation and timeouts**: submitters can abandon jobs without leaking worker slots
//! - **Pluggable drivers**: anything that can create, destroy, probe and run a worker
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  WorkerPool / HealthMonitor                  │
//! │  (cloneable handles, job tickets, periodic health checks)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Coordinator                            │
//! │  (single task owning worker states and the request queue)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerDriver                            │
//! │  (sandboxed processes in production, in-memory for tests)   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use awap_pool::prelude::*;
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = WorkerPool::spawn(Arc::new(InMemoryDriver::new()), PoolConfig::new(2))?;
//! pool.fill_to_capacity().await?;
//!
//! let feedback = pool.execute(json!({"submission": "fn main() {}"})).await?;
//! println!("{feedback}");
//!
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod driver;
pub mod error;
pub mod monitor;

pub use config::PoolConfig;
pub use coordinator::{
    CancellationHandle, HealthReport, JobId, JobTicket, WorkerHealth, WorkerInfo, WorkerPool,
    WorkerStatus,
};
pub use driver::{HealthStatus, InMemoryDriver, JobPayload, JobResult, WorkerDriver, WorkerId};
pub use error::{DriverError, JobError, PoolError};
pub use monitor::{HealthMonitor, MonitorHandle};

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::coordinator::{JobTicket, WorkerPool, WorkerStatus};
    pub use crate::driver::{HealthStatus, InMemoryDriver, WorkerDriver, WorkerId};
    pub use crate::error::{DriverError, JobError, PoolError};
    pub use crate::monitor::HealthMonitor;
}
