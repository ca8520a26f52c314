#![deny(unused)]
//! Lifecycle store for Arena sandbox records.
//!
//! Two `ContainerStore` implementations share one contract:
//! - `InMemoryContainerStore`: DashMap-backed, for tests and single-process
//!   deployments that can lose state on restart.
//! - `SqliteContainerStore`: durable, survives restarts so the reaper can
//!   still find sandboxes launched before a crash.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use arena_core::config::{StoreBackend, StoreConfig};
use arena_core::{ContainerStore, Result};

pub use memory::InMemoryContainerStore;
pub use sqlite::SqliteContainerStore;

/// Open the store selected by `config.backend`.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn ContainerStore>> {
    let store: Arc<dyn ContainerStore> = match config.backend {
        StoreBackend::Memory => Arc::new(InMemoryContainerStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteContainerStore::open(&config.sqlite_path)?),
    };
    tracing::info!(backend = ?config.backend, "Container store opened");
    Ok(store)
}
