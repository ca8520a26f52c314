//! Per-team instance lifecycle.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use arena_core::config::InstanceConfig;
use arena_core::types::{Container, ContainerConfig, ContainerStatus};
use arena_core::{ContainerManager, ContainerStore, Error, Result};

/// Launches and tears down sandboxes, keeping the store in step with the backend.
pub struct InstanceManager {
    manager: Arc<dyn ContainerManager>,
    store: Arc<dyn ContainerStore>,
    extension: Duration,
    renewal_window: Duration,
    /// Serializes launches per (team, challenge).
    launch_locks: DashMap<(String, String), Arc<tokio::sync::Mutex<()>>>,
}

impl InstanceManager {
    pub fn new(
        manager: Arc<dyn ContainerManager>,
        store: Arc<dyn ContainerStore>,
        config: &InstanceConfig,
    ) -> Self {
        Self {
            manager,
            store,
            extension: Duration::minutes(config.extension_minutes),
            renewal_window: Duration::minutes(config.renewal_window_minutes),
            launch_locks: DashMap::new(),
        }
    }

    /// Start a sandbox for the requesting team.
    pub async fn launch(
        &self,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Result<Container> {
        config.validate()?;

        let key = (config.team_id.clone(), config.challenge_id.clone());
        let lock = self.launch_locks.entry(key.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.launch_locked(config, cancel).await
        };

        // Only the map and this task hold the lock: nobody is waiting on it.
        self.launch_locks
            .remove_if(&key, |_, held| Arc::strong_count(held) == 2);
        result
    }

    /// Number of (team, challenge) launch locks currently allocated.
    pub fn pending_launch_locks(&self) -> usize {
        self.launch_locks.len()
    }

    async fn launch_locked(
        &self,
        config: &ContainerConfig,
        cancel: &CancellationToken,
    ) -> Result<Container> {
        if let Some(active) = self
            .store
            .find_active(&config.team_id, &config.challenge_id)
            .await?
        {
            tracing::debug!(
                container_id = %active.id,
                team_id = %config.team_id,
                challenge_id = %config.challenge_id,
                "Launch refused, instance already running"
            );
            return Err(Error::AlreadyRunning {
                team_id: config.team_id.clone(),
                challenge_id: config.challenge_id.clone(),
            });
        }

        let mut container = self.manager.create(config, cancel).await.ok_or_else(|| {
            Error::ContainerUnavailable(format!(
                "{} for team {}",
                config.image, config.team_id
            ))
        })?;

        if let Err(e) = self.store.save(&container).await {
            tracing::error!(
                container_id = %container.id,
                error = %e,
                "Failed to persist new instance, destroying it"
            );
            self.manager.destroy(&mut container, cancel).await;
            return Err(e);
        }

        tracing::info!(
            container_id = %container.id,
            team_id = %config.team_id,
            challenge_id = %config.challenge_id,
            expect_stop_at = %container.expect_stop_at,
            "Instance launched"
        );
        Ok(container)
    }

    /// Push the deadline of an active instance out by one extension.
    pub async fn extend(&self, id: &str) -> Result<Container> {
        self.extend_at(id, Utc::now()).await
    }

    /// `extend` evaluated at `now`.
    pub async fn extend_at(&self, id: &str, now: DateTime<Utc>) -> Result<Container> {
        let mut container = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        if !container.is_active() {
            return Err(Error::invalid_state(format!(
                "container {} is already destroyed",
                id
            )));
        }

        let remaining = container.expect_stop_at - now;
        if remaining > self.renewal_window {
            return Err(Error::invalid_request(format!(
                "container {} can be extended only within {} minutes of its deadline",
                id,
                self.renewal_window.num_minutes()
            )));
        }

        let deadline = container.expect_stop_at + self.extension;
        container.extend_to(deadline);
        self.store.save(&container).await?;

        tracing::info!(
            container_id = %container.id,
            expect_stop_at = %container.expect_stop_at,
            "Instance extended"
        );
        Ok(container)
    }

    /// Destroy an instance and drop its record.
    ///
    /// When the backend teardown does not complete the record is kept and
    /// `Error::DestroyIncomplete` is returned; the reaper retries it later.
    pub async fn terminate(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let mut container = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        self.manager.destroy(&mut container, cancel).await;

        self.store.save(&container).await?;
        if container.status == ContainerStatus::Destroyed {
            self.store.remove(&container).await?;
            tracing::info!(container_id = %id, "Instance terminated");
            Ok(())
        } else {
            tracing::warn!(container_id = %id, status = %container.status, "Instance teardown incomplete");
            Err(Error::DestroyIncomplete(id.to_string()))
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Container>> {
        self.store.get(id).await
    }
}
