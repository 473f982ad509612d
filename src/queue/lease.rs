use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::heartbeat::spawn_lease_heartbeat;
use super::retry::LockScope;
use super::session::{ActiveLease, QueueSession};
use crate::backends::{NewLease, QueueResult};
use crate::model::{LeaseId, RevertSummary, WorkerLease};
use crate::observability::obs;

impl QueueSession {
    /// Registers this session as a worker and starts its heartbeat.
    /// A session that is already registered gets its current lease back.
    #[obs]
    pub async fn register_worker(&mut self) -> QueueResult<WorkerLease> {
        if let Some(active) = &self.lease {
            return Ok(active.lease.clone());
        }
        let config = self.ctx.config();
        let new = NewLease {
            id: LeaseId::new(),
            session_id: self.session_id,
            machine: config.machine_name.clone(),
            process_id: self.ctx.process_id(),
        };
        let new = &new;
        let backend = self.backend();
        let lease = self
            .run("register_lease", LockScope::Main, move |_| {
                backend.register_lease(new)
            })
            .await?;

        let cancel = CancellationToken::new();
        let heartbeat = spawn_lease_heartbeat(
            Arc::clone(self.ctx.backend()),
            lease.id,
            config.lease.heartbeat_interval,
            cancel.clone(),
        );
        info!(
            lease_id = %lease.id,
            machine = %lease.machine,
            process_id = lease.process_id,
            "worker registered"
        );
        self.lease = Some(ActiveLease {
            lease: lease.clone(),
            cancel,
            heartbeat,
        });
        Ok(lease)
    }

    /// Stops the heartbeat, deletes the lease and returns its Processing files
    /// to Pending. Calling it on an unregistered session does nothing.
    #[obs]
    pub async fn unregister_worker(&mut self) -> QueueResult<Option<RevertSummary>> {
        let Some(active) = self.lease.take() else {
            return Ok(None);
        };
        active.cancel.cancel();
        if let Err(err) = active.heartbeat.await {
            warn!(lease_id = %active.lease.id, error = %err, "heartbeat task ended abnormally");
        }
        let lease_id = active.lease.id;
        let backend = self.backend();
        let summary = self
            .run("unregister_lease", LockScope::Main, move |_| {
                backend.unregister_lease(lease_id)
            })
            .await?;
        if let Some(summary) = &summary {
            info!(
                %lease_id,
                reverted = summary.records_reverted,
                "worker unregistered"
            );
        }
        Ok(summary)
    }

    /// Drops a lease the backend no longer knows, typically after a stale sweep
    /// reverted it. Its records are already back on the queue, so nothing is
    /// released; the next `register_worker` starts a fresh lease.
    pub(super) fn forget_lease(&mut self, lease_id: LeaseId) {
        let Some(active) = self.lease.take_if(|active| active.lease.id == lease_id) else {
            return;
        };
        active.cancel.cancel();
        warn!(%lease_id, "worker lease was reverted by a stale sweep; register again to continue");
    }
}
