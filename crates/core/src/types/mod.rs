//! Core data types for Arena.
//!
//! Types are organized by role:
//! - `request`: the per-launch resource request (`ContainerConfig`)
//! - `container`: the persisted sandbox record (`Container`)

pub mod container;
pub mod request;

pub use container::*;
pub use request::*;
