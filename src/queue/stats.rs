use super::registry::WorkflowSelector;
use super::retry::LockScope;
use super::session::QueueSession;
use crate::backends::QueueResult;
use crate::model::AggregateStats;
use crate::observability::obs;

impl QueueSession {
    /// Per-status file, byte and page totals for an action across the selected workflows.
    #[obs]
    pub async fn get_aggregate_stats(
        &self,
        action: &str,
        workflow: &WorkflowSelector,
    ) -> QueueResult<AggregateStats> {
        self.revert_stale_if_due().await;
        let action_ids = self.resolve_action_ids(action, workflow).await?;
        let ids = action_ids.as_slice();
        let backend = self.backend();
        let rows = self
            .run("action_statistics", LockScope::Statistics, move |_| {
                backend.action_statistics(ids)
            })
            .await?;

        let mut stats = AggregateStats {
            action: action.to_string(),
            action_ids: action_ids.clone(),
            ..AggregateStats::default()
        };
        for row in rows.iter().filter(|row| !row.counters.is_zero()) {
            stats
                .by_status
                .entry(row.status)
                .or_default()
                .merge(&row.counters);
        }
        Ok(stats)
    }

    /// Rebuilds counters from the ledger for one action name, or every action when `None`.
    /// Returns the number of counter rows written.
    #[obs]
    pub async fn recalc_statistics(
        &self,
        action: Option<&str>,
        workflow: &WorkflowSelector,
    ) -> QueueResult<u64> {
        let action_ids = match action {
            Some(name) => self.resolve_action_ids(name, workflow).await?,
            None => Vec::new(),
        };
        let ids = action_ids.as_slice();
        let backend = self.backend();
        self.run_locked("recalc_statistics", LockScope::Statistics, move |_| {
            backend.recalc_statistics(ids)
        })
        .await
    }
}
