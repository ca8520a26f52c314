#![deny(unused)]
//! Challenge sandbox drivers for Arena.
//!
//! This crate implements the `ContainerManager` contract over three
//! backends. Each driver translates a `ContainerConfig` into the backend's
//! native resources, decides how the sandbox is exposed, and tears it down
//! idempotently.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────┐
//! │  Controller (InstanceManager / Reaper)     │
//! │    ↓ Arc<dyn ContainerManager>             │
//! ├────────────────────────────────────────────┤
//! │  DockerDriver │ SwarmDriver │ KubeDriver   │
//! │    ↓ DockerApi   ↓ SwarmApi   ↓ KubeApi    │
//! ├────────────────────────────────────────────┤
//! │  bollard (engine / swarm)  │  kube-rs      │
//! └────────────────────────────────────────────┘
//! ```
//!
//! The `*Api` traits are thin seams over the client libraries; `mock`
//! provides in-memory backends so every driver runs without a daemon.
//!
//! # Usage
//!
//! ```ignore
//! use arena_sandbox::factory::build_manager;
//!
//! let manager = build_manager(&config.container_provider).await?;
//! let container = manager.create(&request, &cancel).await;
//! ```

pub mod backend;
pub mod docker;
pub mod exposure;
pub mod factory;
pub mod kubernetes;
pub mod mock;
pub mod naming;
pub mod swarm;

pub use backend::BackendError;
pub use docker::{BollardDocker, DockerApi, DockerDriver, EngineAddress};
pub use exposure::{Exposure, ExposurePolicy};
pub use factory::build_manager;
pub use kubernetes::{KubeApi, KubeClient, KubernetesDriver};
pub use mock::{FakeDocker, FakeKube, FakeSwarm};
pub use swarm::{BollardSwarm, SwarmApi, SwarmDriver};

/// Environment variable carrying the per-team flag inside the sandbox.
pub const FLAG_ENV: &str = "GZCTF_FLAG";

/// Environment variable carrying the owning team id inside the sandbox.
pub const TEAM_ID_ENV: &str = "GZCTF_TEAM_ID";

/// Label keys attached to every backend resource.
pub mod labels {
    pub const TEAM_ID: &str = "arena.team-id";
    pub const USER_ID: &str = "arena.user-id";
    pub const CHALLENGE_ID: &str = "arena.challenge-id";
    pub const RESOURCE_NAME: &str = "arena.resource-name";
}
