//! Lifecycle store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::Container;

/// Persistence for sandbox records.
///
/// Records are keyed by `Container::id`. A record may only leave the store
/// once it is `Destroyed`; removing a live record would orphan the backend
/// resources it points at.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Insert or replace a record.
    async fn save(&self, container: &Container) -> Result<()>;

    /// Load a record by id.
    async fn get(&self, id: &str) -> Result<Option<Container>>;

    /// The active (non-destroyed) record for a team on a challenge, if any.
    async fn find_active(&self, team_id: &str, challenge_id: &str) -> Result<Option<Container>>;

    /// Records whose deadline is strictly before `now`.
    async fn list_dying(&self, now: DateTime<Utc>) -> Result<Vec<Container>>;

    /// Delete a record.
    ///
    /// The stored copy decides: unless it has been saved as `Destroyed` the
    /// call fails with `Error::InvalidState` and nothing is deleted. Removing
    /// an unknown id is a no-op.
    async fn remove(&self, container: &Container) -> Result<()>;
}
