//! Worker loop that drains an action's queue through a [`FileProcessor`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{QueueError, QueueResult};
use crate::model::{Outcome, QueueMode, QueuedFile};
use crate::queue::{DequeueRequest, QueueSession, WorkflowSelector};

/// The work done while a file is Processing.
#[async_trait]
pub trait FileProcessor: Send + Sync {
    async fn process(&self, file: &QueuedFile) -> Outcome;
}

/// Configuration for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerLoopConfig {
    pub action: String,
    pub workflow: WorkflowSelector,
    pub mode: QueueMode,
    /// Files claimed per dequeue call.
    pub batch_size: usize,
    /// Files processed at the same time.
    pub concurrency: usize,
    /// Sleep between polls when the queue is empty.
    pub idle_poll_interval: Duration,
    /// Stop at the first empty poll instead of waiting for more work.
    pub exit_when_idle: bool,
}

impl WorkerLoopConfig {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            workflow: WorkflowSelector::Active,
            mode: QueueMode::PendingAnyUser,
            batch_size: 10,
            concurrency: 4,
            idle_poll_interval: Duration::from_secs(1),
            exit_when_idle: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub requeued: u64,
    /// Outcomes the ledger refused, e.g. because the lease was reverted meanwhile.
    pub rejected: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Failed { .. } => self.failed += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Requeue => self.requeued += 1,
        }
    }
}

/// Registers a worker, claims batches, processes them with bounded
/// concurrency and reports each outcome; unregisters on the way out.
pub struct WorkerLoop<P> {
    session: QueueSession,
    processor: Arc<P>,
    config: WorkerLoopConfig,
    cancel: CancellationToken,
}

impl<P> WorkerLoop<P>
where
    P: FileProcessor + 'static,
{
    pub fn new(session: QueueSession, processor: Arc<P>, config: WorkerLoopConfig) -> Self {
        Self {
            session,
            processor,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling the token finishes the current batch and then stops the loop.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self) -> QueueResult<WorkerStats> {
        let lease = self.session.register_worker().await?;
        info!(
            lease_id = %lease.id,
            action = %self.config.action,
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            "worker loop started"
        );
        let sweeper = self.session.context().spawn_configured_sweeper();
        let result = self.drain().await;
        // Unregister even when the loop failed so claimed files go back to Pending.
        let unregistered = self.session.unregister_worker().await;
        if let Some((handle, shutdown_tx)) = sweeper {
            shutdown_tx.send(true).ok();
            handle.await.ok();
        }
        let stats = result?;
        unregistered?;
        info!(
            claimed = stats.claimed,
            completed = stats.completed,
            failed = stats.failed,
            rejected = stats.rejected,
            "worker loop stopped"
        );
        Ok(stats)
    }

    async fn drain(&mut self) -> QueueResult<WorkerStats> {
        let request = DequeueRequest::new(&self.config.action, self.config.batch_size.max(1))
            .in_workflow(self.config.workflow.clone())
            .with_mode(self.config.mode.clone());
        let mut stats = WorkerStats::default();

        while !self.cancel.is_cancelled() {
            let batch = match self.session.dequeue(&request).await {
                Ok(batch) => batch,
                Err(QueueError::LeaseLost(lost)) => {
                    // Our claims went back to Pending with the old lease.
                    let lease = self.session.register_worker().await?;
                    info!(lost_lease_id = %lost, lease_id = %lease.id, "worker re-registered");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if batch.is_empty() {
                if self.config.exit_when_idle {
                    debug!("queue empty; worker exiting");
                    break;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.idle_poll_interval) => continue,
                }
            }
            stats.claimed += batch.len() as u64;

            let session = &self.session;
            let processor = &self.processor;
            let mut reports = futures::stream::iter(batch)
                .map(|file| async move {
                    let outcome = processor.process(&file).await;
                    let reported = session.report_outcome(&file, &outcome).await;
                    (file, outcome, reported)
                })
                .buffer_unordered(self.config.concurrency.max(1));
            while let Some((file, outcome, reported)) = reports.next().await {
                match reported {
                    Ok(_) => stats.record(&outcome),
                    Err(err) => {
                        stats.rejected += 1;
                        warn!(
                            file_id = %file.file_id,
                            path = %file.path,
                            error = %err,
                            "outcome report rejected"
                        );
                    }
                }
            }
        }
        Ok(stats)
    }
}
