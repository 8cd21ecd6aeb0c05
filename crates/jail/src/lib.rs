//! # Jail Process Driver
//!
//! Runs grading workers as sandboxed child processes for `awap-pool`.
//!
//! Each worker is one long-lived process started from [`JailConfig`]
//! (a locked-down podman container by default). The driver and the worker
//! exchange newline-delimited [`JailMessage`]s over the worker's stdin and
//! stdout; anything the worker writes to stderr is passed through to the
//! host's stderr.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use awap_jail::{JailConfig, ProcessDriver};
//! use awap_pool::{PoolConfig, WorkerPool};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let driver = ProcessDriver::new(JailConfig::podman("grader:latest"));
//! let pool = WorkerPool::spawn(Arc::new(driver), PoolConfig::new(2))?;
//! pool.fill_to_capacity().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod protocol;

pub use config::{JailConfig, DEFAULT_IMAGE};
pub use driver::ProcessDriver;
pub use protocol::JailMessage;
