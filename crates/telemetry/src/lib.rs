#![deny(unused)]
//! Logging, tracing export and metrics for Arena.

pub mod metrics;
pub mod tracing_layer;

pub use self::metrics::{describe_metrics, setup_metrics_recorder};
pub use tracing_layer::{configure_tracing, shutdown_tracing};
