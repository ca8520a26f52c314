//! In-memory container store using DashMap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use arena_core::{
    types::{Container, ContainerStatus},
    ContainerStore, Error, Result,
};

/// Records keyed by container id, held for the lifetime of the process.
#[derive(Debug, Default)]
pub struct InMemoryContainerStore {
    records: DashMap<String, Container>,
}

impl InMemoryContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ContainerStore for InMemoryContainerStore {
    async fn save(&self, container: &Container) -> Result<()> {
        self.records
            .insert(container.id.clone(), container.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Container>> {
        Ok(self.records.get(id).map(|r| r.clone()))
    }

    async fn find_active(&self, team_id: &str, challenge_id: &str) -> Result<Option<Container>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.is_active() && r.team_id == team_id && r.challenge_id == challenge_id)
            .max_by_key(|r| r.started_at)
            .map(|r| r.clone()))
    }

    async fn list_dying(&self, now: DateTime<Utc>) -> Result<Vec<Container>> {
        let mut dying: Vec<Container> = self
            .records
            .iter()
            .filter(|r| r.is_expired(now))
            .map(|r| r.clone())
            .collect();
        dying.sort_by_key(|c| c.expect_stop_at);
        Ok(dying)
    }

    async fn remove(&self, container: &Container) -> Result<()> {
        let removed = self
            .records
            .remove_if(&container.id, |_, stored| {
                stored.status == ContainerStatus::Destroyed
            });
        if removed.is_some() {
            return Ok(());
        }
        match self.records.get(&container.id) {
            Some(stored) => Err(Error::invalid_state(format!(
                "container {} is {}, only destroyed records can be removed",
                container.id, stored.status
            ))),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::types::Endpoint;

    #[tokio::test]
    async fn test_save_replaces_by_id() {
        let store = InMemoryContainerStore::new();
        let mut record = Container::new("c1", "echo", Endpoint::new("10.0.0.2", 7));
        store.save(&record).await.unwrap();

        record.status = ContainerStatus::Running;
        store.save(&record).await.unwrap();

        assert_eq!(store.len(), 1);
        let loaded = store.get("c1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ContainerStatus::Running);
    }
}
