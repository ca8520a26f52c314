//! Subscriber setup: stdout logging plus optional OTLP export.

use arena_core::{Error, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

const SERVICE_NAME: &str = "arena";
const DEFAULT_FILTER: &str = "info,arena=debug";

/// Install the global subscriber.
///
/// `RUST_LOG` drives the filter. Spans are exported over OTLP when
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
pub fn configure_tracing(json_logs: bool) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    let otel_layer = match otlp_endpoint.as_deref() {
        Some(endpoint) => {
            let provider = otlp_provider(endpoint)?;
            let tracer = provider.tracer(SERVICE_NAME);
            opentelemetry::global::set_tracer_provider(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| Error::internal(format!("Tracing already initialized: {}", e)))?;

    if let Some(endpoint) = otlp_endpoint {
        tracing::info!(endpoint = %endpoint, "OpenTelemetry tracing enabled");
    }
    Ok(())
}

/// Flush buffered spans before exit.
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
}

fn otlp_provider(endpoint: &str) -> Result<sdktrace::TracerProvider> {
    let resource = Resource::new(vec![
        KeyValue::new("service.name", SERVICE_NAME),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint),
        )
        .with_trace_config(sdktrace::Config::default().with_resource(resource))
        .install_batch(runtime::Tokio)
        .map_err(|e| Error::config(format!("Failed to install OTLP pipeline for {}: {}", endpoint, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_rejected() {
        configure_tracing(false).unwrap();
        let err = configure_tracing(true).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_otlp_provider_yields_tracer() {
        // The exporter connects lazily, no collector needed.
        let provider = otlp_provider("http://127.0.0.1:4317").unwrap();
        let _layer = tracing_opentelemetry::layer::<tracing_subscriber::Registry>()
            .with_tracer(provider.tracer(SERVICE_NAME));
    }
}
