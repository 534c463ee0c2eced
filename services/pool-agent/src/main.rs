//! devpool agent
//!
//! Starts the coordinator, warms the worker pool and keeps leases alive
//! until interrupted. On ctrl-c the pool is torn down in order: reaper,
//! workers, coordinator.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use devpool_agent::{Config, DeviceService, ProcessLauncher};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        max_devices = config.max_devices,
        worker_bin = %config.worker_bin.display(),
        log_dir = %config.log_dir.display(),
        backend = %config.backend_type,
        "Configuration loaded"
    );

    let launcher = Arc::new(ProcessLauncher::new(config.worker_bin.clone()));
    let service = DeviceService::start(&config, launcher).await?;
    info!(coordinator = %service.coordinator_addr(), "Pool agent running");

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    service.shutdown().await;
    info!("Pool agent shutdown complete");
    Ok(())
}
