//! Background tasks: the per-session lease heartbeat and the optional revert sweeper.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::QueueContext;
use crate::backends::QueueBackend;
use crate::model::LeaseId;

/// Refreshes the lease every `interval` until cancelled or the lease row disappears.
pub(crate) fn spawn_lease_heartbeat(
    backend: Arc<dyn QueueBackend>,
    lease_id: LeaseId,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match backend.heartbeat(lease_id).await {
                Ok(true) => debug!(%lease_id, "lease heartbeat"),
                Ok(false) => {
                    warn!(%lease_id, "lease no longer registered; stopping heartbeat");
                    break;
                }
                Err(err) => warn!(%lease_id, error = %err, "lease heartbeat failed"),
            }
        }
    })
}

/// Periodic stale-lease revert for deployments that do not want to rely on
/// queue traffic to trigger it.
pub struct RevertSweeperTask {
    ctx: Arc<QueueContext>,
    interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl RevertSweeperTask {
    pub fn new(ctx: Arc<QueueContext>, interval: Duration, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            interval,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!(interval_ms = self.interval.as_millis() as u64, "revert sweeper started");
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("revert sweeper shutting down");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.ctx.revert_stale_leases().await {
                        Ok(report) if report.leases_reverted > 0 || report.failures > 0 => {
                            info!(
                                leases = report.leases_reverted,
                                records = report.records_reverted,
                                failures = report.failures,
                                "revert sweep finished"
                            );
                        }
                        Ok(_) => debug!("revert sweep found no stale leases"),
                        Err(err) => error!(error = %err, "revert sweep failed"),
                    }
                }
            }
        }
    }
}

/// Spawns the sweeper; send `true` on the returned sender to stop it.
pub fn spawn_revert_sweeper(
    ctx: Arc<QueueContext>,
    interval: Duration,
) -> (JoinHandle<()>, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = RevertSweeperTask::new(ctx, interval, shutdown_rx);
    let handle = tokio::spawn(task.run());
    (handle, shutdown_tx)
}
