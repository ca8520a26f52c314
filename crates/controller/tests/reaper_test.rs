//! ExpiryReaper tests over the mock backend and the in-memory store.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use arena_controller::{ExpiryReaper, ReapReport};
use arena_core::mocks::MockContainerManager;
use arena_core::types::{Container, ContainerConfig};
use arena_core::{ContainerManager, ContainerStore};
use arena_store::InMemoryContainerStore;

async fn launch(
    backend: &MockContainerManager,
    store: &InMemoryContainerStore,
    team: &str,
    expires_in: Duration,
) -> Container {
    let config = ContainerConfig::new("echo:latest", 7).with_owner(team, "user", "chal");
    let mut container = backend
        .create(&config, &CancellationToken::new())
        .await
        .unwrap();
    container.expect_stop_at = Utc::now() + expires_in;
    store.save(&container).await.unwrap();
    container
}

fn reaper(
    backend: &Arc<MockContainerManager>,
    store: &Arc<InMemoryContainerStore>,
) -> ExpiryReaper {
    ExpiryReaper::new(
        backend.clone(),
        store.clone(),
        std::time::Duration::from_secs(30),
    )
}

#[tokio::test]
async fn test_tick_reaps_only_expired() {
    let backend = Arc::new(MockContainerManager::new());
    let store = Arc::new(InMemoryContainerStore::new());
    let expired = launch(&backend, &store, "t1", Duration::minutes(-1)).await;
    let alive = launch(&backend, &store, "t2", Duration::minutes(30)).await;

    let report = reaper(&backend, &store)
        .tick(Utc::now(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report, ReapReport { destroyed: 1, failed: 0 });
    assert!(!backend.is_live(&expired.id));
    assert!(store.get(&expired.id).await.unwrap().is_none());
    assert!(backend.is_live(&alive.id));
    assert!(store.get(&alive.id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_failed_destroy_is_retried() {
    let backend = Arc::new(MockContainerManager::new());
    let store = Arc::new(InMemoryContainerStore::new());
    let expired = launch(&backend, &store, "t1", Duration::minutes(-1)).await;
    let reaper = reaper(&backend, &store);
    let cancel = CancellationToken::new();

    backend.set_fail_destroy(true);
    let report = reaper.tick(Utc::now(), &cancel).await.unwrap();
    assert_eq!(report, ReapReport { destroyed: 0, failed: 1 });
    assert!(store.get(&expired.id).await.unwrap().is_some());

    backend.set_fail_destroy(false);
    let report = reaper.tick(Utc::now(), &cancel).await.unwrap();
    assert_eq!(report, ReapReport { destroyed: 1, failed: 0 });
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_already_gone_container_is_reaped() {
    let backend = Arc::new(MockContainerManager::new());
    let store = Arc::new(InMemoryContainerStore::new());
    let expired = launch(&backend, &store, "t1", Duration::minutes(-1)).await;
    backend.remove_out_of_band(&expired.id);

    let report = reaper(&backend, &store)
        .tick(Utc::now(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.destroyed, 1);
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_spawned_reaper_runs_until_cancelled() {
    let backend = Arc::new(MockContainerManager::new());
    let store = Arc::new(InMemoryContainerStore::new());
    let expired = launch(&backend, &store, "t1", Duration::minutes(-1)).await;

    let cancel = CancellationToken::new();
    let handle = reaper(&backend, &store).spawn(cancel.clone());

    // The first interval tick fires immediately.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert!(!backend.is_live(&expired.id));
    assert!(store.is_empty());

    cancel.cancel();
    handle.await.unwrap();
}
