#![deny(unused)]
//! Core types, traits, and error definitions for Arena.
//!
//! This crate provides the building blocks shared by the backend drivers,
//! the lifecycle stores and the controller: the per-launch resource request
//! (`ContainerConfig`), the persisted sandbox record (`Container`), the
//! two-method orchestration contract (`ContainerManager`) and the
//! lifecycle store contract (`ContainerStore`).

pub mod config;
pub mod error;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
pub use traits::*;
pub use types::*;
