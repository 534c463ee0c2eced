//! The device service: everything the outer API layer talks to.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use devpool_id::{DeviceId, WorkerId};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::device::{ActionOutcome, DeviceAction};
use crate::error::ServiceError;
use crate::launcher::Launcher;
use crate::lease::{LeaseRegistry, Ttl};
use crate::pool::{CachedDevice, HostPool, PoolStats};
use crate::worker::Liveness;

/// Public description of a leased device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub handle: DeviceId,
    pub name: String,
    pub worker_name: WorkerId,
    pub log_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl From<&CachedDevice> for DeviceInfo {
    fn from(device: &CachedDevice) -> Self {
        Self {
            handle: device.id(),
            name: device.name().to_string(),
            worker_name: device.worker_name(),
            log_path: device.log_path().to_path_buf(),
            created_at: device.created_at(),
        }
    }
}

/// Coordinator, host pool, lease registry and reaper wired together.
pub struct DeviceService {
    coordinator: Arc<Coordinator>,
    pool: HostPool,
    registry: Arc<LeaseRegistry>,
    shutdown_tx: watch::Sender<bool>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceService {
    /// Binds the coordinator, warms the pool and starts the reaper.
    pub async fn start(config: &Config, launcher: Arc<dyn Launcher>) -> Result<Self> {
        config.validate()?;

        let coordinator = Coordinator::bind(config.coordinator_addr)
            .await
            .with_context(|| format!("failed to bind coordinator on {}", config.coordinator_addr))?;

        let pool = HostPool::new(config.pool_config(), launcher, coordinator.clone());
        let registry = Arc::new(LeaseRegistry::new(pool.clone(), config.lease_config()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reaper = tokio::spawn(registry.clone().run_reaper(shutdown_rx));

        info!(coordinator = %coordinator.local_addr(), "Device service started");
        Ok(Self {
            coordinator,
            pool,
            registry,
            shutdown_tx,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn coordinator_addr(&self) -> SocketAddr {
        self.coordinator.local_addr()
    }

    pub fn registry(&self) -> &Arc<LeaseRegistry> {
        &self.registry
    }

    /// Creates a device and waits until it is usable.
    ///
    /// A failed creation gives its pool slot back before returning.
    pub async fn create_device(
        &self,
        name: Option<String>,
        ttl: Option<Ttl>,
    ) -> Result<DeviceInfo, ServiceError> {
        let cached = self.registry.create_device(name, ttl).await?;

        if let Err(e) = cached.device().await {
            warn!(device = %cached.id(), error = %e, "Device creation failed");
            self.registry.release(&[cached.id()]).await;
            return Err(e.into());
        }

        Ok(DeviceInfo::from(&cached))
    }

    /// All leased devices. Listing does not refresh leases.
    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        self.registry
            .list()
            .await
            .iter()
            .map(DeviceInfo::from)
            .collect()
    }

    pub async fn remove_devices(&self, handles: &[DeviceId]) {
        self.registry.release(handles).await;
    }

    /// Runs `action` against a leased device, refreshing its lease.
    pub async fn with_device(
        &self,
        handle: DeviceId,
        action: DeviceAction,
    ) -> Result<ActionOutcome, ServiceError> {
        let cached = self
            .registry
            .get(handle)
            .await
            .ok_or(ServiceError::NotFound(handle))?;
        let device = cached.device().await?;

        if device.host().liveness() != Liveness::Ready {
            return Err(ServiceError::Unreachable(format!(
                "worker {} is {:?}",
                device.host().name(),
                device.host().liveness()
            )));
        }
        if action.requires_login() && !device.has_logged_in_user().await {
            return Err(ServiceError::NotLoggedIn(handle));
        }

        device.perform(action).await.map_err(ServiceError::from)
    }

    /// Restarts the worker hosting `handle` and re-creates the device on it.
    pub async fn recover_device(&self, handle: DeviceId) -> Result<DeviceInfo, ServiceError> {
        let cached = self
            .registry
            .get(handle)
            .await
            .ok_or(ServiceError::NotFound(handle))?;
        let device = cached.device().await?;

        info!(device = %handle, worker = %cached.worker_name(), "Recovering device");
        device
            .host()
            .restart()
            .await
            .map_err(|e| ServiceError::StartupFailed(e.to_string()))?;
        device.respawn().await?;

        Ok(DeviceInfo::from(&cached))
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    /// Stops the reaper, tears the pool down and closes the coordinator.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().await.take();
        let Some(reaper) = reaper else {
            return;
        };

        info!("Shutting down device service");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = reaper.await {
            warn!(error = %e, "Lease reaper ended abnormally");
        }

        let dropped = self.registry.clear();
        debug!(leases = dropped.len(), "Leases dropped");
        self.pool.shutdown_all().await;
        self.coordinator.shutdown();
        info!("Device service stopped");
    }
}
