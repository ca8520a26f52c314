//! Mock implementations of core traits for testing.
//!
//! `MockContainerManager` behaves like a backend that never talks to a
//! daemon: it tracks live sandboxes in memory and can be told to fail
//! creation or destruction.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    traits::ContainerManager,
    types::{Container, ContainerConfig, ContainerStatus, Endpoint},
};

/// In-memory container manager.
#[derive(Default)]
pub struct MockContainerManager {
    live: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
    create_calls: AtomicUsize,
    destroy_calls: AtomicUsize,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
}

impl MockContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create` return `None`.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `destroy` leave the status unchanged.
    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Drop a sandbox behind the manager's back, as an operator would.
    pub fn remove_out_of_band(&self, id: &str) -> bool {
        self.live.lock().unwrap().remove(id)
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.live.lock().unwrap().contains(id)
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerManager for MockContainerManager {
    async fn create(
        &self,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Option<Container> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() || self.fail_create.load(Ordering::SeqCst) {
            return None;
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("mock-{}", n);
        self.live.lock().unwrap().insert(id.clone());

        let mut container = Container::new(
            id,
            config.image.clone(),
            Endpoint::new(format!("10.0.0.{}", n % 250 + 2), config.exposed_port),
        )
        .with_owner(config.team_id.clone(), config.challenge_id.clone());
        container.status = ContainerStatus::Running;
        Some(container)
    }

    async fn destroy(&self, container: &mut Container, cancel: &CancellationToken) {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() || self.fail_destroy.load(Ordering::SeqCst) {
            return;
        }
        // Already gone counts as success.
        self.live.lock().unwrap().remove(&container.id);
        container.mark_destroyed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let manager = MockContainerManager::new();
        let cancel = CancellationToken::new();
        let config = ContainerConfig::new("echo:latest", 7).with_owner("t1", "u1", "c1");

        let mut container = manager.create(&config, &cancel).await.unwrap();
        assert_eq!(container.status, ContainerStatus::Running);
        assert!(manager.is_live(&container.id));

        manager.destroy(&mut container, &cancel).await;
        assert_eq!(container.status, ContainerStatus::Destroyed);
        manager.destroy(&mut container, &cancel).await;
        assert_eq!(container.status, ContainerStatus::Destroyed);
        assert_eq!(manager.live_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_failures() {
        let manager = MockContainerManager::new();
        let cancel = CancellationToken::new();
        let config = ContainerConfig::new("echo:latest", 7);

        manager.set_fail_create(true);
        assert!(manager.create(&config, &cancel).await.is_none());
        manager.set_fail_create(false);

        let mut container = manager.create(&config, &cancel).await.unwrap();
        manager.set_fail_destroy(true);
        manager.destroy(&mut container, &cancel).await;
        assert_eq!(container.status, ContainerStatus::Running);
    }
}
