//! Test harness for pool agent integration tests.
//!
//! Workers run in-process: the launcher spawns the sim-worker session as a
//! tokio task instead of a child process, and terminating the "process"
//! aborts the task, which closes its coordinator connection the same way a
//! killed process would.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use devpool_agent::{
    CachedDevice, Config, Device, DeviceService, LaunchSpec, Launcher, LoginCredentials,
    ProcessHandle, WorkerError,
};
use devpool_id::WorkerId;
use devpool_sim_worker::WorkerOptions;
use tempfile::TempDir;
use tokio::task::{AbortHandle, JoinHandle};

/// How launched workers behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Connect and serve requests.
    Serve,
    /// Never connect, so registration times out.
    Silent,
}

/// Runs workers as tasks of the test runtime.
pub struct TaskLauncher {
    mode: WorkerMode,
    response_delay: Duration,
    launches: AtomicUsize,
    running: Mutex<HashMap<WorkerId, AbortHandle>>,
}

impl TaskLauncher {
    pub fn new() -> Arc<Self> {
        Self::with(WorkerMode::Serve, Duration::ZERO)
    }

    pub fn with(mode: WorkerMode, response_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            response_delay,
            launches: AtomicUsize::new(0),
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Number of launches so far, restarts included.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulates the worker process dying.
    pub fn kill(&self, worker: WorkerId) -> bool {
        match self.running.lock().unwrap().remove(&worker) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl Launcher for TaskLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, WorkerError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let options = WorkerOptions {
            worker_name: spec.worker_name.to_string(),
            coordinator_addr: spec.coordinator_addr,
            backend: spec.backend_type.clone(),
            otr_only: spec.otr_only,
            response_delay: self.response_delay,
        };
        let task = match self.mode {
            WorkerMode::Serve => tokio::spawn(async move {
                let _ = devpool_sim_worker::run(options).await;
            }),
            WorkerMode::Silent => tokio::spawn(std::future::pending::<()>()),
        };

        self.running
            .lock()
            .unwrap()
            .insert(spec.worker_name, task.abort_handle());
        Ok(Box::new(TaskHandle { task: Some(task) }))
    }
}

struct TaskHandle {
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl ProcessHandle for TaskHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        Ok(())
    }
}

/// Config tuned for fast tests: short timeouts, no login settle pause and
/// an ephemeral coordinator port.
pub fn test_config(log_dir: &TempDir) -> Config {
    Config {
        max_devices: 4,
        normal_load_factor: 50,
        min_load_factor: 25,
        default_ttl_ms: 60_000,
        rpc_timeout_secs: 5,
        ping_interval_secs: 1,
        reap_interval_secs: 3_600,
        lifecycle_timeout_secs: 5,
        login_settle_ms: 0,
        log_dir: log_dir.path().to_path_buf(),
        coordinator_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..Config::default()
    }
}

/// A started service plus the pieces tests poke at.
pub struct Harness {
    pub service: DeviceService,
    pub launcher: Arc<TaskLauncher>,
    _log_dir: TempDir,
}

impl Harness {
    pub async fn start() -> Self {
        Self::start_with(TaskLauncher::new(), |_| {}).await
    }

    pub async fn start_with(
        launcher: Arc<TaskLauncher>,
        configure: impl FnOnce(&mut Config),
    ) -> Self {
        let log_dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&log_dir);
        configure(&mut config);

        let service = DeviceService::start(&config, launcher.clone())
            .await
            .unwrap();
        Self {
            service,
            launcher,
            _log_dir: log_dir,
        }
    }

    /// The cached device behind `handle`, without going through an action.
    pub async fn cached(&self, handle: devpool_id::DeviceId) -> CachedDevice {
        self.service
            .registry()
            .list()
            .await
            .into_iter()
            .find(|d| d.id() == handle)
            .expect("device is leased")
    }

    pub async fn device(&self, handle: devpool_id::DeviceId) -> Arc<Device> {
        self.cached(handle).await.device().await.unwrap()
    }

    pub async fn shutdown(self) {
        self.service.shutdown().await;
    }
}

pub fn credentials() -> LoginCredentials {
    LoginCredentials {
        email: "smoketester@example.com".to_string(),
        password: "aqa123456".to_string(),
    }
}

/// Polls `condition` every 20ms until it holds or `within` elapses.
pub async fn eventually<F, Fut>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
