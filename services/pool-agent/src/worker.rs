//! Worker process manager.
//!
//! A [`WorkerProcess`] owns one launched worker: the OS process, the
//! endpoint the worker registered with the coordinator, and the
//! background ping loop watching it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use devpool_id::WorkerId;
use devpool_proto::Request;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::coordinator::Coordinator;
use crate::error::WorkerError;
use crate::launcher::{LaunchSpec, Launcher, ProcessHandle};
use crate::rpc::{Endpoint, RemoteEntity};

/// Liveness of a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    /// Launched, not yet registered.
    Spawning,
    /// Registered and answering pings.
    Ready,
    /// Stopped answering; must be restarted or evicted.
    Unreachable,
    /// Shut down for good.
    Shutdown,
}

#[derive(Default)]
struct Lifecycle {
    process: Option<Box<dyn ProcessHandle>>,
    pinger: Option<JoinHandle<()>>,
}

/// One worker process and its remote endpoint.
pub struct WorkerProcess {
    name: WorkerId,
    log_path: PathBuf,
    config: WorkerConfig,
    remote: RemoteEntity,
    liveness: watch::Sender<Liveness>,
    launcher: Arc<dyn Launcher>,
    coordinator: Arc<Coordinator>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("name", &self.name)
            .field("liveness", &*self.liveness.borrow())
            .field("log_path", &self.log_path)
            .finish()
    }
}

/// Per-worker log file inside `log_dir`.
pub fn log_path_for(log_dir: &Path, name: &WorkerId) -> PathBuf {
    log_dir.join(format!("{}.log", name))
}

impl WorkerProcess {
    /// Launches a worker and waits for it to register.
    pub async fn spawn(
        name: WorkerId,
        config: WorkerConfig,
        launcher: Arc<dyn Launcher>,
        coordinator: Arc<Coordinator>,
    ) -> Result<Arc<Self>, WorkerError> {
        if config.log_dir.as_os_str().is_empty() {
            return Err(WorkerError::MissingLogDestination {
                worker: name.to_string(),
            });
        }

        let log_path = log_path_for(&config.log_dir, &name);
        let (liveness, _) = watch::channel(Liveness::Spawning);
        let worker = Arc::new(Self {
            remote: RemoteEntity::new(name.to_string(), config.lifecycle_timeout),
            name,
            log_path,
            config,
            liveness,
            launcher,
            coordinator,
            lifecycle: Mutex::new(Lifecycle::default()),
        });

        worker.restart().await?;
        Ok(worker)
    }

    /// Stops whatever is running and launches a fresh process.
    ///
    /// Concurrent restarts serialize on the lifecycle lock.
    pub async fn restart(self: &Arc<Self>) -> Result<(), WorkerError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if *self.liveness.borrow() == Liveness::Shutdown {
            return Err(WorkerError::ShutDown(self.name.to_string()));
        }

        if let Some(pinger) = lifecycle.pinger.take() {
            pinger.abort();
        }

        if let Some(endpoint) = self.remote.detach().await {
            match crate::rpc::call(endpoint.as_ref(), Request::Stop, self.config.stop_timeout).await
            {
                Ok(_) => debug!(worker = %self.name, "Worker stopped gracefully"),
                Err(e) => warn!(worker = %self.name, error = %e, "Graceful stop failed"),
            }
        }
        if let Some(mut process) = lifecycle.process.take() {
            if let Err(e) = process.terminate().await {
                warn!(worker = %self.name, error = %e, "Failed to terminate previous process");
            }
        }
        self.coordinator.deregister(&self.name.to_string()).await;

        self.liveness.send_replace(Liveness::Spawning);

        let spec = LaunchSpec {
            worker_name: self.name,
            coordinator_addr: self.coordinator.local_addr(),
            backend_type: self.config.backend_type.clone(),
            otr_only: self.config.otr_only,
            log_path: self.log_path.clone(),
        };
        let process = match self.launcher.launch(&spec).await {
            Ok(process) => process,
            Err(e) => {
                error!(worker = %self.name, error = %e, "Failed to launch worker");
                self.liveness.send_replace(Liveness::Unreachable);
                return Err(e);
            }
        };
        lifecycle.process = Some(process);

        let timeout = self.config.lifecycle_timeout;
        match self
            .coordinator
            .wait_until_registered(&self.name.to_string(), timeout)
            .await
        {
            Ok(endpoint) => {
                self.remote.attach(endpoint).await;
                self.liveness.send_replace(Liveness::Ready);
                lifecycle.pinger = Some(tokio::spawn(ping_loop(
                    Arc::downgrade(self),
                    self.config.ping_interval,
                )));
                info!(worker = %self.name, log = %self.log_path.display(), "Worker ready");
                Ok(())
            }
            Err(e) => {
                error!(
                    worker = %self.name,
                    error = %e,
                    log = %self.log_path.display(),
                    "Worker did not register"
                );
                if let Some(mut process) = lifecycle.process.take() {
                    if let Err(e) = process.terminate().await {
                        warn!(worker = %self.name, error = %e, "Failed to terminate process");
                    }
                }
                self.liveness.send_replace(Liveness::Unreachable);
                Err(WorkerError::Registration {
                    worker: self.name.to_string(),
                    timeout,
                    log_path: self.log_path.clone(),
                })
            }
        }
    }

    /// Stops the ping loop, kills the process and clears the endpoint.
    /// Does nothing once the worker is shut down.
    pub async fn shutdown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *self.liveness.borrow() == Liveness::Shutdown {
            return;
        }

        if let Some(pinger) = lifecycle.pinger.take() {
            pinger.abort();
        }
        if let Some(mut process) = lifecycle.process.take() {
            if let Err(e) = process.terminate().await {
                warn!(worker = %self.name, error = %e, "Failed to terminate worker process");
            }
        }
        self.remote.detach().await;
        self.coordinator.deregister(&self.name.to_string()).await;
        self.liveness.send_replace(Liveness::Shutdown);

        info!(worker = %self.name, "Worker shut down");
    }

    /// One echo round trip with the short liveness timeout.
    pub async fn is_reachable(&self) -> bool {
        self.remote.is_reachable(self.config.echo_timeout).await
    }

    pub fn name(&self) -> WorkerId {
        self.name
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn otr_only(&self) -> bool {
        self.config.otr_only
    }

    /// Current endpoint, present while the worker is registered.
    pub async fn endpoint(&self) -> Option<Arc<dyn Endpoint>> {
        self.remote.endpoint().await
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let Ok(lifecycle) = self.lifecycle.try_lock() {
            if let Some(pinger) = &lifecycle.pinger {
                pinger.abort();
            }
        }
    }
}

async fn ping_loop(worker: Weak<WorkerProcess>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(worker) = worker.upgrade() else {
            break;
        };

        if worker.is_reachable().await {
            debug!(worker = %worker.name, "Ping ok");
            continue;
        }

        warn!(worker = %worker.name, "Worker stopped answering pings");
        worker.liveness.send_if_modified(|state| {
            if *state == Liveness::Ready {
                *state = Liveness::Unreachable;
                true
            } else {
                false
            }
        });
        break;
    }
}
