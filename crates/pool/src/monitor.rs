//! Periodic health monitor
//!
//! Runs [`WorkerPool::health_check`] on a fixed interval. Failed workers are
//! removed and replaced by the coordinator itself; the monitor additionally
//! tops the pool back up to capacity when earlier replacements failed.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::coordinator::WorkerPool;
use crate::error::PoolError;

/// Shortest interval the monitor will tick at
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Background task that health-checks a pool on an interval
pub struct HealthMonitor {
    pool: WorkerPool,
    interval: Duration,
    replenish: bool,
}

impl HealthMonitor {
    /// Monitor using the pool's configured interval
    pub fn new(pool: WorkerPool) -> Self {
        let interval = pool.config().health_check_interval.max(MIN_INTERVAL);
        Self {
            pool,
            interval,
            replenish: true,
        }
    }

    /// Override the check interval
    ///
    /// Intervals shorter than 10ms are raised to 10ms.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Enable or disable starting workers when the pool is below capacity
    pub fn with_replenish(mut self, replenish: bool) -> Self {
        self.replenish = replenish;
        self
    }

    /// Start the monitor loop
    pub fn start(self) -> MonitorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        MonitorHandle { shutdown_tx, join }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, replenish = self.replenish, "Health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.check_once().await {
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Health monitor: shutdown requested");
                    break;
                }
            }
        }

        debug!("Health monitor exited");
    }

    /// One monitor pass; returns false once the pool is gone
    async fn check_once(&self) -> bool {
        let report = match self.pool.health_check().await {
            Ok(report) => report,
            Err(PoolError::ShuttingDown) => return false,
            Err(e) => {
                error!("Health check failed: {}", e);
                return true;
            }
        };

        for worker in report.unhealthy() {
            warn!(
                worker_id = %worker.id,
                error = worker.error.as_deref().unwrap_or("unhealthy"),
                "Worker failed health check"
            );
        }

        let missing = report.missing_workers();
        if self.replenish && missing > 0 {
            info!(missing, "Pool below capacity, starting workers");
            for _ in 0..missing {
                match self.pool.start_worker().await {
                    Ok(id) => debug!(worker_id = %id, "Replenished worker"),
                    // A replacement started by the coordinator already holds the slot
                    Err(PoolError::CapacityExceeded { .. }) => break,
                    Err(PoolError::ShuttingDown) => return false,
                    Err(e) => {
                        warn!(error = %e, "Failed to replenish worker");
                        break;
                    }
                }
            }
        }

        true
    }
}

/// Handle to a running [`HealthMonitor`]
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for its loop to exit
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            error!("Health monitor task failed: {}", e);
        }
    }

    /// Whether the monitor loop has exited
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
