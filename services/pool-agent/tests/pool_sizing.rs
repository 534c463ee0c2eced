//! Integration tests for pool sizing, capacity and slot ownership.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{eventually, Harness, TaskLauncher};
use devpool_agent::DeviceAction;
use devpool_id::DeviceId;

#[tokio::test]
async fn test_same_name_gives_distinct_devices() {
    let harness = Harness::start().await;

    let first = harness
        .service
        .create_device(Some("alpha".to_string()), None)
        .await
        .unwrap();
    let second = harness
        .service
        .create_device(Some("alpha".to_string()), None)
        .await
        .unwrap();

    assert_ne!(first.handle, second.handle);
    assert_ne!(first.worker_name, second.worker_name);
    assert_eq!(first.name, "alpha");
    assert_eq!(second.name, "alpha");
    assert_eq!(harness.service.list_devices().await.len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_default_name_and_log_path() {
    let harness = Harness::start().await;

    let info = harness.service.create_device(None, None).await.unwrap();

    assert!(info.name.starts_with("Device_"));
    assert_eq!(
        info.log_path.file_name().unwrap().to_string_lossy(),
        format!("{}.log", info.worker_name)
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_capacity_is_enforced_and_freed_by_release() {
    let harness = Harness::start_with(TaskLauncher::new(), |config| {
        config.max_devices = 1;
    })
    .await;

    let first = harness.service.create_device(None, None).await.unwrap();

    let err = harness.service.create_device(None, None).await.unwrap_err();
    assert_eq!(err.reason_code(), "capacity_exceeded");

    harness.service.remove_devices(&[first.handle]).await;
    assert!(harness.service.list_devices().await.is_empty());

    let again = harness.service.create_device(None, None).await.unwrap();
    assert_ne!(again.handle, first.handle);
    assert_ne!(again.worker_name, first.worker_name);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_warm_pool_starts_at_normal_size() {
    let launcher = TaskLauncher::new();
    let harness = Harness::start_with(launcher.clone(), |config| {
        config.max_devices = 4;
        config.normal_load_factor = 50;
    })
    .await;

    let service = &harness.service;
    let warmed = eventually(Duration::from_secs(5), move || async move {
        service.pool_stats().await.idle_ready == 2
    })
    .await;
    assert!(warmed);

    let stats = harness.service.pool_stats().await;
    assert_eq!(stats.total, 2);
    assert_eq!(stats.leased, 0);
    assert_eq!(launcher.launches(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_release_below_min_refills_to_normal() {
    let harness = Harness::start_with(TaskLauncher::new(), |config| {
        config.max_devices = 4;
        config.normal_load_factor = 50;
        config.min_load_factor = 50;
    })
    .await;

    let first = harness.service.create_device(None, None).await.unwrap();
    let _second = harness.service.create_device(None, None).await.unwrap();
    assert_eq!(harness.service.pool_stats().await.leased, 2);

    harness.service.remove_devices(&[first.handle]).await;

    let service = &harness.service;
    let refilled = eventually(Duration::from_secs(5), move || async move {
        let stats = service.pool_stats().await;
        stats.total == 2 && stats.leased == 1 && stats.idle_ready == 1
    })
    .await;
    assert!(refilled);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_creations_get_their_own_workers() {
    let harness = Harness::start_with(TaskLauncher::new(), |config| {
        config.max_devices = 3;
    })
    .await;

    let (a, b, c) = tokio::join!(
        harness.service.create_device(None, None),
        harness.service.create_device(None, None),
        harness.service.create_device(None, None),
    );
    let devices = [a.unwrap(), b.unwrap(), c.unwrap()];

    let workers: HashSet<_> = devices.iter().map(|d| d.worker_name).collect();
    assert_eq!(workers.len(), 3);
    assert_eq!(harness.service.pool_stats().await.leased, 3);

    let err = harness.service.create_device(None, None).await.unwrap_err();
    assert_eq!(err.reason_code(), "capacity_exceeded");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unknown_release_is_a_no_op() {
    let harness = Harness::start().await;
    let info = harness.service.create_device(None, None).await.unwrap();

    harness.service.remove_devices(&[DeviceId::new()]).await;
    harness.service.remove_devices(&[]).await;

    let listed = harness.service.list_devices().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].handle, info.handle);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_batch_release() {
    let harness = Harness::start().await;
    let a = harness.service.create_device(None, None).await.unwrap();
    let b = harness.service.create_device(None, None).await.unwrap();
    let c = harness.service.create_device(None, None).await.unwrap();

    harness
        .service
        .remove_devices(&[a.handle, c.handle, DeviceId::new()])
        .await;

    let listed = harness.service.list_devices().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].handle, b.handle);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_stops_creation() {
    let harness = Harness::start().await;
    let info = harness.service.create_device(None, None).await.unwrap();

    harness.service.shutdown().await;
    harness.service.shutdown().await;

    let err = harness.service.create_device(None, None).await.unwrap_err();
    assert_eq!(err.reason_code(), "unreachable");
    assert_eq!(harness.service.pool_stats().await.total, 0);

    // Leases go with the pool.
    assert!(harness.service.list_devices().await.is_empty());
    let err = harness
        .service
        .with_device(info.handle, DeviceAction::RemoteId)
        .await
        .unwrap_err();
    assert_eq!(err.reason_code(), "not_found");
}
