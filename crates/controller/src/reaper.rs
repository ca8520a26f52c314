//! Background reclamation of expired sandboxes.
//!
//! Every tick lists the records whose deadline has passed, destroys them and
//! drops the ones whose teardown completed. Records that could not be
//! destroyed stay in the store and are retried on the next tick.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use arena_core::types::ContainerStatus;
use arena_core::{ContainerManager, ContainerStore, Result};

/// Outcome of one reaper pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapReport {
    /// Records destroyed and removed.
    pub destroyed: usize,
    /// Records left for the next pass.
    pub failed: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.destroyed == 0 && self.failed == 0
    }
}

pub struct ExpiryReaper {
    manager: Arc<dyn ContainerManager>,
    store: Arc<dyn ContainerStore>,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(
        manager: Arc<dyn ContainerManager>,
        store: Arc<dyn ContainerStore>,
        interval: Duration,
    ) -> Self {
        Self {
            manager,
            store,
            interval,
        }
    }

    /// Destroy every record whose deadline is before `now`.
    pub async fn tick(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<ReapReport> {
        let dying = self.store.list_dying(now).await?;
        let mut report = ReapReport::default();

        for mut container in dying {
            if cancel.is_cancelled() {
                break;
            }

            if container.status != ContainerStatus::Destroyed {
                self.manager.destroy(&mut container, cancel).await;
            }

            if container.status != ContainerStatus::Destroyed {
                tracing::warn!(
                    container_id = %container.id,
                    expect_stop_at = %container.expect_stop_at,
                    "Expired container not destroyed, retrying next pass"
                );
                report.failed += 1;
                continue;
            }

            let removed = match self.store.save(&container).await {
                Ok(()) => self.store.remove(&container).await,
                Err(e) => Err(e),
            };
            match removed {
                Ok(()) => {
                    tracing::info!(
                        container_id = %container.id,
                        team_id = %container.team_id,
                        challenge_id = %container.challenge_id,
                        "Expired container reaped"
                    );
                    report.destroyed += 1;
                }
                Err(e) => {
                    tracing::error!(container_id = %container.id, error = %e, "Failed to remove reaped record");
                    report.failed += 1;
                }
            }
        }

        metrics::counter!("reaper_reaped_total", "outcome" => "destroyed")
            .increment(report.destroyed as u64);
        metrics::counter!("reaper_reaped_total", "outcome" => "failed")
            .increment(report.failed as u64);
        Ok(report)
    }

    /// Tick every `interval` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_secs = self.interval.as_secs(), "Expiry reaper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick(Utc::now(), &cancel).await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => tracing::info!(
                    destroyed = report.destroyed,
                    failed = report.failed,
                    "Reaper pass finished"
                ),
                Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
            }
        }
        tracing::info!("Expiry reaper stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }
}
