//! Integration tests for worker process start, restart and shutdown.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{TaskLauncher, WorkerMode};
use devpool_agent::{Coordinator, Liveness, WorkerConfig, WorkerError, WorkerProcess};
use devpool_id::WorkerId;
use tempfile::TempDir;

async fn coordinator() -> Arc<Coordinator> {
    Coordinator::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap()
}

fn worker_config(log_dir: &TempDir) -> WorkerConfig {
    WorkerConfig {
        log_dir: log_dir.path().to_path_buf(),
        lifecycle_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(1),
        ping_interval: Duration::from_secs(1),
        ..WorkerConfig::default()
    }
}

#[tokio::test]
async fn test_spawn_registers_and_answers_pings() {
    let log_dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator().await;
    let name = WorkerId::new();

    let worker = WorkerProcess::spawn(
        name,
        worker_config(&log_dir),
        TaskLauncher::new(),
        coordinator.clone(),
    )
    .await
    .unwrap();

    assert_eq!(worker.name(), name);
    assert_eq!(worker.liveness(), Liveness::Ready);
    assert!(worker.is_reachable().await);
    assert_eq!(coordinator.registered_count().await, 1);
    assert_eq!(
        worker.log_path(),
        log_dir.path().join(format!("{}.log", name))
    );

    worker.shutdown().await;
}

#[tokio::test]
async fn test_restart_launches_a_fresh_process() {
    let log_dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator().await;
    let launcher = TaskLauncher::new();

    let worker = WorkerProcess::spawn(
        WorkerId::new(),
        worker_config(&log_dir),
        launcher.clone(),
        coordinator.clone(),
    )
    .await
    .unwrap();
    let before = worker.endpoint().await.unwrap();

    worker.restart().await.unwrap();

    let after = worker.endpoint().await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(launcher.launches(), 2);
    assert_eq!(worker.liveness(), Liveness::Ready);
    assert!(worker.is_reachable().await);
    assert_eq!(coordinator.registered_count().await, 1);

    worker.shutdown().await;
}

#[tokio::test]
async fn test_registration_timeout_reports_log_path() {
    let log_dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator().await;
    let config = WorkerConfig {
        lifecycle_timeout: Duration::from_millis(300),
        ..worker_config(&log_dir)
    };

    let err = WorkerProcess::spawn(
        WorkerId::new(),
        config,
        TaskLauncher::with(WorkerMode::Silent, Duration::ZERO),
        coordinator,
    )
    .await
    .unwrap_err();

    match &err {
        WorkerError::Registration { log_path, .. } => {
            assert!(log_path.starts_with(log_dir.path()));
            assert!(err.to_string().contains(&log_path.display().to_string()));
        }
        other => panic!("expected registration error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_log_dir_is_rejected() {
    let coordinator = coordinator().await;
    let config = WorkerConfig {
        log_dir: Default::default(),
        ..WorkerConfig::default()
    };
    let launcher = TaskLauncher::new();

    let err = WorkerProcess::spawn(WorkerId::new(), config, launcher.clone(), coordinator)
        .await
        .unwrap_err();

    assert!(matches!(err, WorkerError::MissingLogDestination { .. }));
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let log_dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator().await;

    let worker = WorkerProcess::spawn(
        WorkerId::new(),
        worker_config(&log_dir),
        TaskLauncher::new(),
        coordinator.clone(),
    )
    .await
    .unwrap();

    worker.shutdown().await;
    worker.shutdown().await;

    assert_eq!(worker.liveness(), Liveness::Shutdown);
    assert!(!worker.is_reachable().await);
    assert!(worker.endpoint().await.is_none());
    assert_eq!(coordinator.registered_count().await, 0);

    let err = worker.restart().await.unwrap_err();
    assert!(matches!(err, WorkerError::ShutDown(_)));
}
