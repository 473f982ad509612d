use super::registry::WorkflowSelector;
use super::retry::LockScope;
use super::session::QueueSession;
use crate::backends::{DequeueClaim, QueueError, QueueResult};
use crate::model::{DequeueOrder, QueueMode, QueuedFile};
use crate::observability::obs;

/// What to claim in one dequeue call.
#[derive(Clone, Debug)]
pub struct DequeueRequest {
    pub action: String,
    pub workflow: WorkflowSelector,
    pub max_count: usize,
    pub mode: QueueMode,
    /// Defaults to random when `random_dequeue` is configured, sequence otherwise.
    pub order: Option<DequeueOrder>,
}

impl DequeueRequest {
    pub fn new(action: impl Into<String>, max_count: usize) -> Self {
        Self {
            action: action.into(),
            workflow: WorkflowSelector::Active,
            max_count,
            mode: QueueMode::PendingAnyUser,
            order: None,
        }
    }

    pub fn in_workflow(mut self, workflow: WorkflowSelector) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn with_mode(mut self, mode: QueueMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_order(mut self, order: DequeueOrder) -> Self {
        self.order = Some(order);
        self
    }
}

impl QueueSession {
    /// Claims up to `max_count` eligible files and marks them Processing under
    /// this session's lease. Fewer files, or none, is not an error.
    ///
    /// If the lease was reverted as stale in the meantime the call fails with
    /// `LeaseLost` and the session is left unregistered.
    #[obs]
    pub async fn dequeue(&mut self, request: &DequeueRequest) -> QueueResult<Vec<QueuedFile>> {
        let lease_id = self
            .lease()
            .map(|lease| lease.id)
            .ok_or_else(|| {
                QueueError::Configuration("dequeue requires a registered worker".into())
            })?;
        if request.max_count == 0 {
            return Ok(Vec::new());
        }
        self.revert_stale_if_due().await;

        let action_ids = self
            .resolve_action_ids(&request.action, &request.workflow)
            .await?;
        let config = self.ctx.config();
        let order = request.order.unwrap_or(if config.random_dequeue {
            DequeueOrder::Random
        } else {
            DequeueOrder::Sequence
        });
        let claim = DequeueClaim {
            action_ids,
            lease_id,
            max_count: request.max_count,
            mode: request.mode.clone(),
            order,
            lease_timeout: config.lease.timeout,
        };
        let claim = &claim;
        let backend = self.backend();
        let result = self
            .run("dequeue", LockScope::Main, move |mode| {
                backend.dequeue(claim, mode)
            })
            .await;
        if let Err(QueueError::LeaseLost(lost)) = &result {
            self.forget_lease(*lost);
        }
        result
    }
}
