#![deny(unused)]
//! Instance lifecycle control for Arena.
//!
//! Ties a `ContainerManager` to a `ContainerStore`:
//! - `InstanceManager` launches, extends and terminates one sandbox per
//!   (team, challenge).
//! - `ExpiryReaper` periodically destroys sandboxes past their deadline.

pub mod instance;
pub mod reaper;

pub use instance::InstanceManager;
pub use reaper::{ExpiryReaper, ReapReport};
