//! Process-wide queue state shared by every session.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::heartbeat::spawn_revert_sweeper;
use super::session::QueueSession;
use crate::backends::{PostgresBackend, QueueBackend, QueueResult};
use crate::config::QueueConfig;
use crate::model::RevertReport;
use crate::observability::obs;

/// Backend, configuration and revert throttle for one process.
///
/// Sessions hold an `Arc` to the context; there is no global instance.
pub struct QueueContext {
    backend: Arc<dyn QueueBackend>,
    config: QueueConfig,
    process_id: i64,
    last_revert_check: Mutex<Option<Instant>>,
}

impl QueueContext {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            config,
            process_id: i64::from(std::process::id()),
            last_revert_check: Mutex::new(None),
        })
    }

    /// Builds the pool without connecting; the first query opens a connection.
    pub fn connect_lazy(config: QueueConfig) -> QueueResult<Arc<Self>> {
        let backend = PostgresBackend::connect_lazy(&config.database_url, config.max_connections)?;
        Ok(Self::new(Arc::new(backend), config))
    }

    /// Connects now and applies pending migrations.
    pub async fn connect_and_migrate(config: QueueConfig) -> QueueResult<Arc<Self>> {
        let backend =
            PostgresBackend::connect(&config.database_url, config.max_connections).await?;
        info!(max_connections = config.max_connections, "connected to queue database");
        Ok(Self::new(Arc::new(backend), config))
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn process_id(&self) -> i64 {
        self.process_id
    }

    pub fn session(self: &Arc<Self>) -> QueueSession {
        QueueSession::new(Arc::clone(self))
    }

    /// Starts the periodic revert sweeper when `lease.sweep_interval` is set.
    pub fn spawn_configured_sweeper(
        self: &Arc<Self>,
    ) -> Option<(JoinHandle<()>, watch::Sender<bool>)> {
        let interval = self.config.lease.sweep_interval?;
        Some(spawn_revert_sweeper(Arc::clone(self), interval))
    }

    pub async fn shutdown(&self) {
        self.backend.close().await;
        debug!(backend = self.backend.name(), "queue context closed");
    }

    /// Reverts every lease whose heartbeat is older than the lease timeout.
    /// Staleness is judged on the backend's clock, not this host's.
    ///
    /// Each lease is reverted on its own; a failure is logged and counted and
    /// the sweep moves on.
    #[obs]
    pub async fn revert_stale_leases(&self) -> QueueResult<RevertReport> {
        let timeout = self.config.lease.timeout;
        let leases = self.backend.stale_leases(timeout).await?;
        let mut report = RevertReport::default();
        for lease in leases {
            match self.backend.revert_stale_lease(lease.id, timeout).await {
                Ok(Some(summary)) => {
                    report.leases_reverted += 1;
                    report.records_reverted += summary.records_reverted;
                    info!(
                        lease_id = %lease.id,
                        machine = %lease.machine,
                        process_id = lease.process_id,
                        last_heartbeat = %lease.last_heartbeat,
                        reverted = summary.records_reverted,
                        "reverted stale worker lease"
                    );
                }
                Ok(None) => {
                    debug!(lease_id = %lease.id, "stale lease refreshed or already reverted");
                }
                Err(err) => {
                    report.failures += 1;
                    warn!(lease_id = %lease.id, error = %err, "failed to revert stale lease");
                }
            }
        }
        Ok(report)
    }

    /// Runs the revert sweep unless one ran within `revert_check_interval`.
    pub async fn revert_stale_if_due(&self) -> QueueResult<Option<RevertReport>> {
        if !self.claim_revert_slot(self.config.lease.revert_check_interval) {
            return Ok(None);
        }
        self.revert_stale_leases().await.map(Some)
    }

    fn claim_revert_slot(&self, interval: Duration) -> bool {
        let mut last = self
            .last_revert_check
            .lock()
            .expect("revert throttle poisoned");
        if last.is_some_and(|at| at.elapsed() < interval) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    #[test]
    fn revert_slot_is_throttled() {
        let mut config = QueueConfig::test_config("memory://");
        config.lease.revert_check_interval = Duration::from_secs(60);
        let ctx = QueueContext::new(Arc::new(MemoryBackend::new()), config);
        assert!(ctx.claim_revert_slot(Duration::from_secs(60)));
        assert!(!ctx.claim_revert_slot(Duration::from_secs(60)));
        assert!(ctx.claim_revert_slot(Duration::ZERO));
    }

    #[tokio::test]
    async fn sweeper_only_starts_when_configured() {
        let ctx = QueueContext::new(
            Arc::new(MemoryBackend::new()),
            QueueConfig::test_config("memory://"),
        );
        assert!(ctx.spawn_configured_sweeper().is_none());

        let mut config = QueueConfig::test_config("memory://");
        config.lease.sweep_interval = Some(Duration::from_millis(5));
        let ctx = QueueContext::new(Arc::new(MemoryBackend::new()), config);
        let (handle, shutdown_tx) = ctx.spawn_configured_sweeper().expect("sweeper");
        shutdown_tx.send(true).expect("send shutdown");
        handle.await.expect("sweeper task");
    }
}
