//! Lease registry.
//!
//! Every device handed out by the pool is wrapped in a [`Lease`] with a
//! sliding TTL. Looking a lease up refreshes it; a background reaper
//! releases the ones nobody touched in time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use devpool_id::DeviceId;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::config::LeaseConfig;
use crate::error::PoolError;
use crate::pool::{CachedDevice, HostPool, ReleaseBatch};

/// Lifetime of a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Finite(Duration),
    /// Never expires.
    Infinite,
}

impl Ttl {
    /// `u64::MAX` is the infinite sentinel.
    pub fn from_millis(ms: u64) -> Self {
        if ms == u64::MAX {
            Ttl::Infinite
        } else {
            Ttl::Finite(Duration::from_millis(ms))
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, Ttl::Infinite)
    }
}

/// Sliding expiration window.
#[derive(Debug, Clone, Copy)]
pub struct TtlWindow {
    ttl: Ttl,
    refreshed_at: Instant,
}

impl TtlWindow {
    pub fn start(ttl: Ttl) -> Self {
        Self {
            ttl,
            refreshed_at: Instant::now(),
        }
    }

    pub fn ttl(&self) -> Ttl {
        self.ttl
    }

    /// Restarts the window.
    pub fn refresh(&mut self) {
        self.refreshed_at = Instant::now();
    }

    /// Time left at `now`; `Ttl::Infinite` for windows that never close.
    pub fn remaining_at(&self, now: Instant) -> Ttl {
        match self.ttl {
            Ttl::Infinite => Ttl::Infinite,
            Ttl::Finite(ttl) => {
                let elapsed = now.saturating_duration_since(self.refreshed_at);
                Ttl::Finite(ttl.saturating_sub(elapsed))
            }
        }
    }

    pub fn remaining(&self) -> Ttl {
        self.remaining_at(Instant::now())
    }

    /// Remaining time is zero or less.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.remaining_at(now), Ttl::Finite(left) if left.is_zero())
    }
}

/// Binding of a handle to a cached device.
#[derive(Debug, Clone)]
pub struct Lease {
    device: CachedDevice,
    window: TtlWindow,
}

impl Lease {
    pub fn new(device: CachedDevice, ttl: Ttl) -> Self {
        Self {
            device,
            window: TtlWindow::start(ttl),
        }
    }

    pub fn device(&self) -> &CachedDevice {
        &self.device
    }

    pub fn window(&self) -> &TtlWindow {
        &self.window
    }
}

/// Result of one reaper sweep.
pub struct Reaped {
    pub ids: Vec<DeviceId>,
    release: Option<ReleaseBatch>,
}

impl Reaped {
    /// Waits for the pool releases triggered by the sweep.
    pub async fn wait(self, timeout: Duration) -> bool {
        match self.release {
            Some(batch) => batch.wait(timeout).await,
            None => true,
        }
    }
}

/// Registry of live leases.
///
/// The lease map is only locked between awaits, so claiming a pool slot
/// and recording its lease cannot be split by a dropped caller.
pub struct LeaseRegistry {
    pool: HostPool,
    config: LeaseConfig,
    leases: Mutex<HashMap<DeviceId, Lease>>,
}

impl LeaseRegistry {
    pub fn new(pool: HostPool, config: LeaseConfig) -> Self {
        Self {
            pool,
            config,
            leases: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &HostPool {
        &self.pool
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<DeviceId, Lease>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Gets a device from the pool and leases it. `None` uses the default
    /// TTL.
    pub async fn create_device(
        &self,
        name: Option<String>,
        ttl: Option<Ttl>,
    ) -> Result<CachedDevice, PoolError> {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let device = self.pool.create_device(name).await?;

        self.leases().insert(device.id(), Lease::new(device.clone(), ttl));
        debug!(device = %device.id(), ?ttl, "Lease created");
        Ok(device)
    }

    /// Devices for the matching handles. Every match is refreshed.
    pub async fn lookup(&self, ids: &[DeviceId]) -> Vec<CachedDevice> {
        let mut leases = self.leases();
        ids.iter()
            .filter_map(|id| {
                leases.get_mut(id).map(|lease| {
                    lease.window.refresh();
                    lease.device.clone()
                })
            })
            .collect()
    }

    /// Single-handle [`LeaseRegistry::lookup`].
    pub async fn get(&self, id: DeviceId) -> Option<CachedDevice> {
        self.lookup(&[id]).await.pop()
    }

    /// All leased devices, oldest first. Does not refresh.
    pub async fn list(&self) -> Vec<CachedDevice> {
        let mut devices: Vec<_> =
            self.leases().values().map(|lease| lease.device.clone()).collect();
        devices.sort_by_key(CachedDevice::id);
        devices
    }

    /// Remaining lifetime of a lease, without refreshing it.
    pub async fn remaining(&self, id: DeviceId) -> Option<Ttl> {
        self.leases().get(&id).map(|lease| lease.window.remaining())
    }

    /// Drops the matching leases and releases their pool slots.
    pub async fn release(&self, ids: &[DeviceId]) {
        let released: Vec<DeviceId> = {
            let mut leases = self.leases();
            ids.iter()
                .filter(|id| leases.remove(*id).is_some())
                .copied()
                .collect()
        };

        match released.as_slice() {
            [] => debug!(requested = ids.len(), "Nothing to release"),
            [id] => self.pool.release(*id).await,
            _ => {
                let count = released.len();
                let batch = self.pool.release_many(released);
                if !batch.wait(self.config.release_timeout).await {
                    info!(
                        count,
                        timeout_secs = self.config.release_timeout.as_secs(),
                        "Batch release still running after timeout"
                    );
                }
            }
        }
    }

    /// Forgets every lease without releasing its slot. Used when the whole
    /// pool is being torn down.
    pub fn clear(&self) -> Vec<DeviceId> {
        let ids: Vec<_> = self.leases().drain().map(|(id, _)| id).collect();
        if !ids.is_empty() {
            info!(count = ids.len(), "Dropping all leases");
        }
        ids
    }

    /// Removes every expired lease and starts releasing its slot.
    pub async fn reap_expired(&self) -> Reaped {
        let now = Instant::now();
        let expired: Vec<DeviceId> = {
            let mut leases = self.leases();
            let ids: Vec<_> = leases
                .iter()
                .filter(|(_, lease)| lease.window.is_expired_at(now))
                .map(|(id, _)| *id)
                .collect();
            for id in &ids {
                leases.remove(id);
            }
            ids
        };

        if expired.is_empty() {
            return Reaped {
                ids: expired,
                release: None,
            };
        }

        info!(count = expired.len(), "Reaping expired leases");
        let release = self.pool.release_many(expired.clone());
        Reaped {
            ids: expired,
            release: Some(release),
        }
    }

    /// Sweeps periodically until `shutdown` flips to true.
    #[instrument(skip(self, shutdown))]
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.reap_interval.as_secs(),
            first_run_secs = self.config.first_reap_delay.as_secs(),
            "Starting lease reaper"
        );

        let start = Instant::now() + self.config.first_reap_delay;
        let mut interval = tokio::time::interval_at(start, self.config.reap_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reaped = self.reap_expired().await;
                    if !reaped.ids.is_empty() {
                        debug!(count = reaped.ids.len(), "Sweep done");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Lease reaper shutting down");
                        break;
                    }
                }
            }
        }
    }
}
