//! Prometheus metrics.

use arena_core::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder.
///
/// With `listen_addr` the exporter also serves `/metrics` on that address and
/// no handle is returned; without it the caller renders through the handle.
pub fn setup_metrics_recorder(listen_addr: Option<&str>) -> Result<Option<PrometheusHandle>> {
    let handle = match listen_addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| Error::config(format!("Invalid metrics address {}: {}", addr, e)))?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| {
                    Error::config(format!("Failed to install Prometheus exporter: {}", e))
                })?;
            tracing::info!(addr = %addr, "Prometheus exporter listening");
            None
        }
        None => {
            let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
                Error::config(format!("Failed to install Prometheus recorder: {}", e))
            })?;
            tracing::info!("Prometheus metrics recorder initialized");
            Some(handle)
        }
    };

    describe_metrics();
    Ok(handle)
}

/// Register descriptions for every metric Arena emits.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "container_create_total",
        "Sandbox creation attempts by backend and outcome"
    );
    metrics::describe_counter!(
        "container_destroy_total",
        "Sandbox teardown attempts by backend and outcome"
    );
    metrics::describe_counter!(
        "reaper_reaped_total",
        "Expired sandboxes handled by the reaper, by outcome"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_listen_address() {
        let err = setup_metrics_recorder(Some("not-an-address")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
