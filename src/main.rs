#![deny(unused)]
//! Arena - challenge instance orchestration.
//!
//! Connects the configured container backend, opens the lifecycle store and
//! runs the expiry reaper until interrupted. Launch, extension and
//! termination are driven by the embedding platform through
//! `arena_controller::InstanceManager`.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use arena_controller::ExpiryReaper;
use arena_core::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;

    arena_telemetry::configure_tracing(config.telemetry.json_logs)?;
    tracing::info!("Starting Arena v{}", env!("CARGO_PKG_VERSION"));

    let _metrics =
        arena_telemetry::setup_metrics_recorder(config.telemetry.metrics_addr.as_deref())?;

    // =========================================================================
    // Backend and store
    // =========================================================================
    let manager = arena_sandbox::build_manager(&config.container_provider).await?;
    let store = arena_store::open_store(&config.store)?;

    // =========================================================================
    // Expiry reaper
    // =========================================================================
    let shutdown = CancellationToken::new();
    let reaper = ExpiryReaper::new(
        manager,
        store,
        Duration::from_secs(config.reaper.interval_secs),
    )
    .spawn(shutdown.clone());

    tracing::info!(
        provider = config.container_provider.provider.as_str(),
        store = ?config.store.backend,
        "Arena is running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");

    shutdown.cancel();
    reaper.await?;

    tracing::info!("Arena stopped");
    arena_telemetry::shutdown_tracing();
    Ok(())
}
