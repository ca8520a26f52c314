//! Core traits for Arena.
//!
//! - `manager`: the orchestration contract every backend driver implements
//! - `store`: lifecycle persistence for sandbox records

pub mod manager;
pub mod store;

pub use manager::*;
pub use store::*;
