//! End-to-end lifecycle: real drivers over fake backends, a real store and
//! the controller on top. No daemon or cluster required.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use arena_controller::{ExpiryReaper, InstanceManager, ReapReport};
use arena_core::config::{AppConfig, PortMappingType};
use arena_core::types::{ContainerConfig, ContainerStatus};
use arena_core::{ContainerManager, ContainerStore, Error};
use arena_sandbox::{DockerDriver, FakeDocker, FakeKube, KubernetesDriver};
use arena_store::{InMemoryContainerStore, SqliteContainerStore};

fn request(team: &str) -> ContainerConfig {
    ContainerConfig::new("echo:latest", 7)
        .with_limits(1, 64, 256)
        .with_owner(team, "user-1", "chal-1")
}

#[tokio::test]
async fn test_docker_launch_expire_reap() {
    let config = AppConfig::default();
    let fake = Arc::new(FakeDocker::new().with_image("echo:latest"));
    let manager: Arc<dyn ContainerManager> =
        Arc::new(DockerDriver::new(fake.clone(), config.container_provider.clone()));
    let store = Arc::new(InMemoryContainerStore::new());
    let instances = InstanceManager::new(manager.clone(), store.clone(), &config.instance);
    let reaper = ExpiryReaper::new(manager, store.clone(), std::time::Duration::from_secs(30));
    let cancel = CancellationToken::new();

    let container = instances.launch(&request("t1"), &cancel).await.unwrap();
    assert_eq!(container.status, ContainerStatus::Running);
    assert_eq!(fake.container_count(), 1);

    // Nothing has expired yet.
    let report = reaper.tick(Utc::now(), &cancel).await.unwrap();
    assert_eq!(report, ReapReport::default());

    // Two hours and a minute later the sandbox is reclaimed.
    let later = Utc::now() + Duration::minutes(121);
    let report = reaper.tick(later, &cancel).await.unwrap();
    assert_eq!(report, ReapReport { destroyed: 1, failed: 0 });
    assert_eq!(fake.container_count(), 0);
    assert!(store.get(&container.id).await.unwrap().is_none());

    // The slot is free again.
    instances.launch(&request("t1"), &cancel).await.unwrap();
}

#[tokio::test]
async fn test_kubernetes_with_durable_store() {
    let mut config = AppConfig::default();
    config.container_provider.port_mapping = PortMappingType::PlatformProxy;
    let fake = Arc::new(FakeKube::new());
    let manager: Arc<dyn ContainerManager> =
        Arc::new(KubernetesDriver::new(fake.clone(), config.container_provider.clone()));
    let store = Arc::new(SqliteContainerStore::open_in_memory().unwrap());
    let instances = InstanceManager::new(manager, store.clone(), &config.instance);
    let cancel = CancellationToken::new();

    let container = instances.launch(&request("t1"), &cancel).await.unwrap();
    assert!(container.is_proxy);
    assert_eq!(fake.pod_count(), 1);

    let stored = store.find_active("t1", "chal-1").await.unwrap().unwrap();
    assert_eq!(stored.id, container.id);
    assert_eq!(stored.internal, container.internal);

    let err = instances.launch(&request("t1"), &cancel).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning { .. }));

    instances.terminate(&container.id, &cancel).await.unwrap();
    assert_eq!(fake.pod_count(), 0);
    assert_eq!(fake.service_count(), 0);
    assert!(store.get(&container.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_kubernetes_launch_leaves_no_trace() {
    let config = AppConfig::default();
    let fake = Arc::new(FakeKube::new());
    fake.set_fail_service_create(true);
    let manager: Arc<dyn ContainerManager> =
        Arc::new(KubernetesDriver::new(fake.clone(), config.container_provider.clone()));
    let store = Arc::new(InMemoryContainerStore::new());
    let instances = InstanceManager::new(manager, store.clone(), &config.instance);

    let err = instances
        .launch(&request("t1"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ContainerUnavailable(_)));
    assert_eq!(fake.pod_count(), 0);
    assert!(store.is_empty());
}
