//! Worker launch mechanism.
//!
//! The [`Launcher`] trait abstracts how a worker process is started so the
//! pool can be driven by real executables in production and by in-process
//! workers in tests.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use devpool_id::WorkerId;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::WorkerError;

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub worker_name: WorkerId,
    pub coordinator_addr: SocketAddr,
    pub backend_type: String,
    pub otr_only: bool,
    /// Combined stdout/stderr destination, opened in append mode.
    pub log_path: PathBuf,
}

impl LaunchSpec {
    /// Positional arguments passed to the worker executable.
    pub fn args(&self) -> Vec<String> {
        vec![
            self.worker_name.to_string(),
            self.coordinator_addr.to_string(),
            self.backend_type.clone(),
            self.otr_only.to_string(),
        ]
    }
}

/// A started worker process.
#[async_trait]
pub trait ProcessHandle: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Force-terminates the process. Safe to call more than once.
    async fn terminate(&mut self) -> std::io::Result<()>;
}

/// Starts worker processes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, WorkerError>;
}

/// Launches the worker executable as a child process.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, WorkerError> {
        let worker = spec.worker_name.to_string();
        if spec.log_path.as_os_str().is_empty() {
            return Err(WorkerError::MissingLogDestination { worker });
        }

        let launch_err = |source| WorkerError::Launch {
            worker: worker.clone(),
            source,
        };

        if let Some(parent) = spec.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(launch_err)?;
            }
        }

        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .map_err(launch_err)?;
        let stderr = stdout.try_clone().map_err(launch_err)?;

        let child = Command::new(&self.program)
            .args(spec.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;

        info!(
            worker = %worker,
            pid = ?child.id(),
            program = %self.program.display(),
            log = %spec.log_path.display(),
            "Worker process started"
        );

        Ok(Box::new(ChildProcess { worker, child }))
    }
}

struct ChildProcess {
    worker: String,
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self) -> std::io::Result<()> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(worker = %self.worker, %status, "Worker process already exited");
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!(worker = %self.worker, error = %e, "Failed to poll worker process"),
        }

        self.child.kill().await?;
        info!(worker = %self.worker, "Worker process killed");
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(log_path: PathBuf) -> LaunchSpec {
        LaunchSpec {
            worker_name: WorkerId::new(),
            coordinator_addr: "127.0.0.1:4000".parse().unwrap(),
            backend_type: "staging".to_string(),
            otr_only: true,
            log_path,
        }
    }

    #[test]
    fn test_args_order() {
        let spec = spec(PathBuf::from("w.log"));
        let args = spec.args();
        assert_eq!(args[0], spec.worker_name.to_string());
        assert_eq!(args[1], "127.0.0.1:4000");
        assert_eq!(args[2], "staging");
        assert_eq!(args[3], "true");
    }

    #[tokio::test]
    async fn test_missing_log_destination_is_fatal() {
        let launcher = ProcessLauncher::new("true");
        let result = launcher.launch(&spec(PathBuf::new())).await;
        assert!(matches!(
            result,
            Err(WorkerError::MissingLogDestination { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_program_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new(dir.path().join("no-such-worker"));
        let result = launcher.launch(&spec(dir.path().join("w.log"))).await;
        assert!(matches!(result, Err(WorkerError::Launch { .. })));
    }

    #[tokio::test]
    async fn test_log_file_is_created_and_terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logcat").join("w.log");
        let launcher = ProcessLauncher::new("sleep");

        let mut handle = match launcher.launch(&spec(log_path.clone())).await {
            Ok(handle) => handle,
            Err(e) => panic!("launch failed: {}", e),
        };

        assert!(log_path.exists());
        assert!(handle.id().is_some());
        handle.terminate().await.unwrap();
        handle.terminate().await.unwrap();
    }
}
