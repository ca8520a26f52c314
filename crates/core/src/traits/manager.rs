//! Orchestration contract.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::types::{Container, ContainerConfig};

/// Backend-agnostic sandbox lifecycle.
///
/// Implemented once per backend (single-host Docker, Docker Swarm,
/// Kubernetes) and selected at startup from configuration. Implementations
/// hold only read-only handles, so one instance is shared across tasks.
///
/// Neither method returns an error: backend failures are logged where they
/// happen and reported through the return value (`create`) or the record's
/// status (`destroy`).
#[async_trait]
pub trait ContainerManager: Send + Sync {
    /// Launch a sandbox.
    ///
    /// Returns `None` when the backend could not schedule it. A returned
    /// record always refers to a sandbox that exists in the backend; partially
    /// created resources are cleaned up before `None` is returned, including
    /// when `cancel` fires mid-creation.
    async fn create(&self, config: &ContainerConfig, cancel: &CancellationToken)
        -> Option<Container>;

    /// Tear a sandbox down.
    ///
    /// Idempotent: a backend "not found" counts as success. On success the
    /// record becomes `Destroyed`; on any other failure (or cancellation) the
    /// status is left untouched so the caller can retry.
    async fn destroy(&self, container: &mut Container, cancel: &CancellationToken);
}
