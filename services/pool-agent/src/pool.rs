//! Host pool.
//!
//! Keeps a warm set of worker processes and attaches each new device to
//! exactly one of them. Slots live in a single vector guarded by one mutex;
//! the lock is only held for bookkeeping, never across a remote call or a
//! process launch.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devpool_id::{DeviceId, WorkerId};
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PoolConfig, WorkerConfig};
use crate::coordinator::Coordinator;
use crate::device::{Device, DeviceOptions};
use crate::error::PoolError;
use crate::launcher::Launcher;
use crate::pending::{Outcome, Pending};
use crate::worker::{log_path_for, Liveness, WorkerProcess};

/// Default name for devices created without one: `Device_` and eight hex
/// characters.
pub fn default_device_name() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("Device_{}", &uuid[..8])
}

/// A device attached to a pool slot. Cheap to clone.
#[derive(Clone)]
pub struct CachedDevice {
    id: DeviceId,
    name: String,
    worker_name: WorkerId,
    log_path: PathBuf,
    created_at: DateTime<Utc>,
    device: Pending<Device>,
}

impl CachedDevice {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the hosting worker.
    pub fn worker_name(&self) -> WorkerId {
        self.worker_name
    }

    /// Log file of the hosting worker.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True once device creation finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        self.device.is_done()
    }

    /// Waits for the device to be created.
    pub async fn device(&self) -> Outcome<Device> {
        self.device.wait().await
    }
}

impl std::fmt::Debug for CachedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedDevice")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("worker_name", &self.worker_name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct PoolSlot {
    worker_name: WorkerId,
    worker: Pending<WorkerProcess>,
    device: Option<CachedDevice>,
}

impl PoolSlot {
    fn is_idle(&self) -> bool {
        self.device.is_none()
    }

    /// Worker finished spawning and is usable.
    fn is_ready(&self) -> bool {
        matches!(self.worker.peek(), Some(Ok(w)) if w.liveness() == Liveness::Ready)
    }

    /// Worker failed to come up, went unreachable or was shut down.
    fn is_defunct(&self) -> bool {
        match self.worker.peek() {
            Some(Ok(worker)) => matches!(
                worker.liveness(),
                Liveness::Unreachable | Liveness::Shutdown
            ),
            Some(Err(_)) => true,
            None => false,
        }
    }
}

/// Snapshot of the pool's occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Idle slots whose worker is up.
    pub idle_ready: usize,
    /// Idle slots whose worker is still starting.
    pub idle_spawning: usize,
    /// Slots holding a device.
    pub leased: usize,
    /// All slots, including idle ones whose worker failed.
    pub total: usize,
}

#[derive(Default)]
struct PoolState {
    slots: Vec<PoolSlot>,
    shut_down: bool,
}

/// Starts worker processes for new slots.
struct WorkerFactory {
    config: WorkerConfig,
    launcher: Arc<dyn Launcher>,
    coordinator: Arc<Coordinator>,
    permits: Arc<Semaphore>,
}

impl WorkerFactory {
    fn spawn_slot(&self) -> PoolSlot {
        let worker_name = WorkerId::new();
        let config = self.config.clone();
        let launcher = self.launcher.clone();
        let coordinator = self.coordinator.clone();

        let worker = Pending::spawn_limited(self.permits.clone(), async move {
            WorkerProcess::spawn(worker_name, config, launcher, coordinator)
                .await
                .map_err(PoolError::from)
        });

        PoolSlot {
            worker_name,
            worker,
            device: None,
        }
    }

    fn spawn_slots(&self, count: usize) -> Vec<PoolSlot> {
        (0..count).map(|_| self.spawn_slot()).collect()
    }
}

struct PoolInner {
    config: PoolConfig,
    device_options: DeviceOptions,
    factory: WorkerFactory,
    coordinator: Arc<Coordinator>,
    device_permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

/// Warm pool of worker processes.
#[derive(Clone)]
pub struct HostPool {
    inner: Arc<PoolInner>,
}

impl HostPool {
    /// Builds the pool and starts `normal_size` warm workers in the
    /// background.
    pub fn new(
        config: PoolConfig,
        launcher: Arc<dyn Launcher>,
        coordinator: Arc<Coordinator>,
    ) -> Self {
        let factory = WorkerFactory {
            config: config.worker.clone(),
            launcher,
            coordinator: coordinator.clone(),
            permits: Arc::new(Semaphore::new(config.spawn_concurrency.max(1))),
        };

        let warm = config.normal_size().min(config.max_size);
        let slots = factory.spawn_slots(warm);
        info!(
            max = config.max_size,
            normal = config.normal_size(),
            min = config.min_size(),
            "Host pool started"
        );

        let device_options = DeviceOptions {
            action_timeout: config.action_timeout,
            login_settle_delay: config.login_settle_delay,
        };
        let device_permits = Arc::new(Semaphore::new(config.device_concurrency.max(1)));

        Self {
            inner: Arc::new(PoolInner {
                config,
                device_options,
                factory,
                coordinator,
                device_permits,
                state: Mutex::new(PoolState {
                    slots,
                    shut_down: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Attaches a new device to an idle worker, or to a freshly spawned one
    /// while the pool is below its maximum.
    ///
    /// Returns as soon as the slot is claimed; the device itself is created
    /// in the background.
    pub async fn create_device(&self, name: Option<String>) -> Result<CachedDevice, PoolError> {
        let name = name.unwrap_or_else(default_device_name);
        let max = self.inner.config.max_size;

        let mut evicted = Vec::new();
        let result = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }

            let mut kept = Vec::with_capacity(state.slots.len());
            for slot in state.slots.drain(..) {
                if slot.is_idle() && slot.is_defunct() {
                    evicted.push(slot);
                } else {
                    kept.push(slot);
                }
            }
            state.slots = kept;

            let idle_ready = state.slots.iter().position(|s| s.is_idle() && s.is_ready());
            let oldest_idle = state.slots.iter().position(PoolSlot::is_idle);
            let index = match idle_ready.or(oldest_idle) {
                Some(index) => {
                    let worker = state.slots[index].worker_name;
                    debug!(device = %name, worker = %worker, "Reusing idle worker");
                    Some(index)
                }
                None if state.slots.len() < max => {
                    let slot = self.inner.factory.spawn_slot();
                    debug!(device = %name, worker = %slot.worker_name, "Spawning worker on demand");
                    state.slots.push(slot);
                    Some(state.slots.len() - 1)
                }
                None => None,
            };

            let result = match index {
                Some(index) => {
                    let cached = self.attach(&state.slots[index], name);
                    state.slots[index].device = Some(cached.clone());
                    Ok(cached)
                }
                None => Err(PoolError::CapacityExceeded { max }),
            };

            if !evicted.is_empty() {
                self.refill(&mut state);
            }
            debug!(size = state.slots.len(), "Pool size");
            result
        };

        for slot in evicted {
            warn!(worker = %slot.worker_name, "Evicting failed idle worker");
            tokio::spawn(retire_worker(slot.worker));
        }

        if let Ok(cached) = &result {
            info!(
                device = %cached.id,
                name = %cached.name,
                worker = %cached.worker_name,
                "Device attached"
            );
        }
        result
    }

    /// Starts device creation inside `slot`'s worker.
    fn attach(&self, slot: &PoolSlot, name: String) -> CachedDevice {
        let worker = slot.worker.clone();
        let permits = self.inner.device_permits.clone();
        let options = self.inner.device_options.clone();
        let device_name = name.clone();

        let device = Pending::spawn(async move {
            let host = worker.wait().await.map_err(PoolError::HostUnavailable)?;
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| PoolError::ShutDown)?;
            Device::spawn_on(host, &device_name, &options)
                .await
                .map_err(PoolError::from)
        });

        CachedDevice {
            id: DeviceId::new(),
            name,
            worker_name: slot.worker_name,
            log_path: log_path_for(&self.inner.config.worker.log_dir, &slot.worker_name),
            created_at: Utc::now(),
            device,
        }
    }

    /// Tops the pool back up to `normal_size` once it fell below
    /// `min_size`.
    fn refill(&self, state: &mut PoolState) {
        let size = state.slots.len();
        let (min, normal) = (self.inner.config.min_size(), self.inner.config.normal_size());
        if size >= min {
            debug!(size, min, "Pool above refill threshold");
            return;
        }

        let missing = normal.min(self.inner.config.max_size).saturating_sub(size);
        info!(size, missing, "Refilling warm pool");
        state.slots.extend(self.inner.factory.spawn_slots(missing));
    }

    /// Removes the slot holding `id` and shuts its worker down. Unknown
    /// ids are ignored.
    pub async fn release(&self, id: DeviceId) {
        let slot = {
            let mut state = self.inner.state.lock().await;
            let position = state
                .slots
                .iter()
                .position(|s| s.device.as_ref().is_some_and(|d| d.id == id));
            match position {
                Some(position) => {
                    let slot = state.slots.remove(position);
                    self.refill(&mut state);
                    debug!(size = state.slots.len(), "Pool size");
                    slot
                }
                None => {
                    debug!(device = %id, "Release of unknown device ignored");
                    return;
                }
            }
        };

        if let Some(cached) = &slot.device {
            if let Some(Ok(device)) = cached.device.peek() {
                device.destroy().await;
            }
        }
        info!(device = %id, worker = %slot.worker_name, "Releasing device and its worker");
        retire_worker(slot.worker).await;
    }

    /// Releases every id in parallel. The returned batch can be awaited or
    /// dropped; dropping it does not cancel the releases.
    pub fn release_many(&self, ids: Vec<DeviceId>) -> ReleaseBatch {
        let handles = ids
            .into_iter()
            .map(|id| {
                let pool = self.clone();
                tokio::spawn(async move { pool.release(id).await })
            })
            .collect();
        ReleaseBatch { handles }
    }

    /// Shuts down every worker and tells the coordinator to release all
    /// remote resources. Subsequent calls do nothing.
    pub async fn shutdown_all(&self) {
        let slots = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            std::mem::take(&mut state.slots)
        };

        info!(workers = slots.len(), "Shutting down device pool");
        self.inner.coordinator.release_all().await;

        let mut pending = Vec::new();
        for slot in slots {
            match slot.worker.peek() {
                Some(Ok(worker)) => worker.shutdown().await,
                Some(Err(_)) => {}
                None => pending.push(tokio::spawn(retire_worker(slot.worker))),
            }
        }
        for handle in pending {
            let _ = handle.await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let mut stats = PoolStats {
            total: state.slots.len(),
            ..PoolStats::default()
        };
        for slot in &state.slots {
            if !slot.is_idle() {
                stats.leased += 1;
            } else if slot.is_ready() {
                stats.idle_ready += 1;
            } else if !slot.worker.is_done() {
                stats.idle_spawning += 1;
            }
        }
        stats
    }
}

/// Waits for a worker to finish spawning, then shuts it down.
async fn retire_worker(worker: Pending<WorkerProcess>) {
    match worker.wait().await {
        Ok(worker) => worker.shutdown().await,
        Err(e) => debug!(error = %e, "Worker never came up, nothing to shut down"),
    }
}

/// Handles of an in-flight parallel release.
pub struct ReleaseBatch {
    handles: Vec<JoinHandle<()>>,
}

impl ReleaseBatch {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits up to `timeout` for every release. Returns false on timeout;
    /// the remaining releases keep running.
    pub async fn wait(self, timeout: Duration) -> bool {
        let all = async {
            for handle in self.handles {
                if let Err(e) = handle.await {
                    warn!(error = %e, "Release task failed");
                }
            }
        };
        tokio::time::timeout(timeout, all).await.is_ok()
    }
}
