//! Pool coordinator
//!
//! This module provides:
//! - [`WorkerPool`] - Cloneable handle used to manage workers and submit jobs
//! - [`JobTicket`] - Claim on the outcome of one submitted job
//! - [`WorkerInfo`] / [`HealthReport`] - Snapshots of pool state
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  commands (bounded)  ┌──────────────────────────────┐
//! │  WorkerPool  │ ───────────────────▶ │         Coordinator          │
//! │  (handles)   │                      │  ┌────────────────────────┐  │
//! └──────────────┘                      │  │       PoolState        │  │
//!        ▲                              │  │  workers  + reserved   │  │
//!        │ oneshot replies              │  │  RequestQueue (FIFO)   │  │
//!        └───────────────────────────── │  └────────────────────────┘  │
//!                                       └──────┬───────────────▲───────┘
//!                                   spawn      │               │ events
//!                                              ▼               │ (unbounded)
//!                                       ┌──────────────────────┴───────┐
//!                                       │ driver tasks                 │
//!                                       │ create / destroy / execute / │
//!                                       │ health                       │
//!                                       └──────────────────────────────┘
//! ```
//!
//! Only the coordinator task reads or writes `PoolState`.
//! Driver calls run on their own tasks and report back as events, so the
//! coordinator never waits on a worker.

mod actor;
mod pool;
mod queue;
mod state;
mod ticket;

pub use pool::WorkerPool;
pub use queue::JobId;
pub use state::{HealthReport, WorkerHealth, WorkerInfo, WorkerStatus};
pub use ticket::{CancellationHandle, JobTicket};
