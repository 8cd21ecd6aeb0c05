mod batch;
mod telemetry;

use std::sync::Arc;

use anyhow::{Context, Result};
use awap_jail::{JailConfig, ProcessDriver};
use awap_pool::{HealthMonitor, PoolConfig, WorkerPool};
use tokio::io::BufReader;

use crate::batch::run_batch;
use crate::telemetry::{init_telemetry, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Values already in the environment win over .env
    let dotenv = dotenvy::dotenv();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "awap=info")
    // - AWAP_POOL_*, AWAP_JOB_*, AWAP_HEALTH_*: Pool settings
    // - AWAP_JAIL_*: How worker processes are launched
    let telemetry_config = TelemetryConfig::from_env();
    init_telemetry(&telemetry_config);

    if let Ok(path) = dotenv {
        tracing::info!("Loaded .env from {:?}", path);
    }
    tracing::info!("awap-orchestrator starting...");

    let pool_config = PoolConfig::from_env().context("Invalid pool configuration")?;
    let jail_config = JailConfig::from_env().context("Invalid jail configuration")?;

    tracing::info!(
        capacity = pool_config.capacity,
        max_queue_len = ?pool_config.max_queue_len,
        job_timeout = ?pool_config.job_timeout,
        jail_command = %jail_config.command,
        "Starting worker pool"
    );

    let driver = Arc::new(ProcessDriver::new(jail_config));
    let pool = WorkerPool::spawn(driver, pool_config).context("Failed to start worker pool")?;

    if let Err(e) = pool.fill_to_capacity().await {
        pool.shutdown().await.ok();
        return Err(e).context("Failed to start workers");
    }

    let monitor = HealthMonitor::new(pool.clone()).start();
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let result = tokio::select! {
        result = run_batch(&pool, stdin, stdout) => result.map(Some),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(None)
        }
    };

    monitor.stop().await;
    pool.shutdown().await.context("Failed to shut down worker pool")?;

    match result {
        Ok(Some(summary)) => tracing::info!(
            completed = summary.completed,
            failed = summary.failed,
            "Orchestrator shutdown complete"
        ),
        Ok(None) => tracing::info!("Orchestrator interrupted, pending jobs were abandoned"),
        Err(e) => {
            tracing::error!(error = %e, "Batch failed");
            return Err(e);
        }
    }
    Ok(())
}
