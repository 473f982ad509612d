//! Enqueue, outcome reports and administrative status changes.

use super::registry::WorkflowSelector;
use super::retry::LockScope;
use super::session::QueueSession;
use crate::backends::{
    BulkStatusChange, EnqueueFile, EnqueueOutcome, QueueError, QueueResult, StatusTransition,
    TransitionOutcome,
};
use crate::model::{
    Action, ActionId, FileId, FileRecord, Outcome, Priority, QueueRecord, QueueStatus,
    QueuedFile, StatusChange,
};
use crate::observability::obs;

/// A file to put on an action's queue.
#[derive(Clone, Debug)]
pub struct EnqueueRequest {
    pub path: String,
    pub action: String,
    pub workflow: WorkflowSelector,
    pub size_bytes: Option<i64>,
    pub page_count: Option<i32>,
    pub priority: Option<Priority>,
    /// Take the file back from a worker that is still processing it.
    pub force: bool,
}

impl EnqueueRequest {
    pub fn new(path: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            action: action.into(),
            workflow: WorkflowSelector::Active,
            size_bytes: None,
            page_count: None,
            priority: None,
            force: false,
        }
    }

    pub fn in_workflow(mut self, workflow: WorkflowSelector) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn with_size(mut self, size_bytes: i64, page_count: i32) -> Self {
        self.size_bytes = Some(size_bytes);
        self.page_count = Some(page_count);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// An administrative change of one file's status.
#[derive(Clone, Debug)]
pub struct SetStatusRequest {
    pub path: String,
    pub action: String,
    pub workflow: WorkflowSelector,
    pub to: QueueStatus,
    /// Rejected unless the ledger still holds this status.
    pub expected_from: Option<QueueStatus>,
    pub force: bool,
    pub comment: Option<String>,
    pub priority: Option<Priority>,
}

impl SetStatusRequest {
    pub fn new(path: impl Into<String>, action: impl Into<String>, to: QueueStatus) -> Self {
        Self {
            path: path.into(),
            action: action.into(),
            workflow: WorkflowSelector::Active,
            to,
            expected_from: None,
            force: false,
            comment: None,
            priority: None,
        }
    }

    pub fn in_workflow(mut self, workflow: WorkflowSelector) -> Self {
        self.workflow = workflow;
        self
    }

    pub fn expecting(mut self, from: QueueStatus) -> Self {
        self.expected_from = Some(from);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

impl QueueSession {
    /// Queues the file for the action, creating the file and action rows on first use.
    #[obs]
    pub async fn enqueue(&self, request: &EnqueueRequest) -> QueueResult<EnqueueOutcome> {
        if request.path.trim().is_empty() {
            return Err(QueueError::InvalidRequest("file path must not be empty".into()));
        }
        self.revert_stale_if_due().await;
        let action = self
            .get_or_create_action(&request.action, &request.workflow)
            .await?;
        let file = EnqueueFile {
            path: request.path.clone(),
            size_bytes: request.size_bytes,
            page_count: request.page_count,
            action_id: action.id,
            workflow_id: action.workflow_id,
            priority: request.priority,
            force: request.force,
        };
        let file = &file;
        let backend = self.backend();
        self.run("enqueue_file", LockScope::Main, move |mode| {
            backend.enqueue_file(file, mode)
        })
        .await
    }

    /// Records a worker's result for a file it dequeued.
    ///
    /// Fails with `StatusMismatch` or `LeaseMismatch` once the file has been
    /// reverted or handed to another worker.
    #[obs]
    pub async fn report_outcome(
        &self,
        file: &QueuedFile,
        outcome: &Outcome,
    ) -> QueueResult<TransitionOutcome> {
        let comment = match outcome {
            Outcome::Failed { comment } => comment.clone(),
            _ => None,
        };
        let transition = StatusTransition {
            expected_from: Some(QueueStatus::Processing),
            lease_id: Some(file.lease_id),
            comment,
            user: Some(self.user.clone()),
            ..StatusTransition::new(file.file_id, file.action_id, outcome.target_status())
        };
        let transition = &transition;
        let backend = self.backend();
        self.run("transition", LockScope::Main, move |mode| {
            backend.transition(transition, mode)
        })
        .await
    }

    /// Sets one file's status for every action the request's name resolves to.
    #[obs]
    pub async fn set_status(
        &self,
        request: &SetStatusRequest,
    ) -> QueueResult<Vec<(ActionId, TransitionOutcome)>> {
        if matches!(request.to, QueueStatus::Processing | QueueStatus::Unattempted) {
            return Err(QueueError::InvalidRequest(format!(
                "status cannot be set to {}",
                request.to
            )));
        }
        let file = self.require_file(&request.path).await?;
        let actions = self
            .resolve_actions(&request.action, &request.workflow)
            .await?;

        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            let transition = StatusTransition {
                expected_from: request.expected_from,
                force: request.force,
                lease_id: None,
                comment: request.comment.clone(),
                user: Some(self.user.clone()),
                priority: request.priority,
                ..StatusTransition::new(file.id, action.id, request.to)
            };
            let transition = &transition;
            let backend = self.backend();
            let outcome = self
                .run("transition", LockScope::Main, move |mode| {
                    backend.transition(transition, mode)
                })
                .await?;
            outcomes.push((action.id, outcome));
        }
        Ok(outcomes)
    }

    /// Moves every file of the action's workflow to `to`, one workflow at a time.
    ///
    /// Files being processed are left alone. Failed is only reachable through
    /// an explicit failure report, so it is rejected here along with Processing.
    #[obs]
    pub async fn set_status_for_all_files(
        &self,
        action: &str,
        workflow: &WorkflowSelector,
        to: QueueStatus,
        priority: Option<Priority>,
    ) -> QueueResult<u64> {
        if matches!(to, QueueStatus::Processing | QueueStatus::Failed) {
            return Err(QueueError::InvalidRequest(format!(
                "bulk status change to {to} is not allowed"
            )));
        }
        let actions = self.resolve_actions(action, workflow).await?;
        let mut changed = 0;
        for action in actions {
            let change = BulkStatusChange {
                action_id: action.id,
                to,
                user: Some(self.user.clone()),
                priority,
            };
            let change = &change;
            let backend = self.backend();
            changed += self
                .run("set_status_for_action", LockScope::Main, move |mode| {
                    backend.set_status_for_action(change, mode)
                })
                .await?;
        }
        Ok(changed)
    }

    pub async fn file(&self, path: &str) -> QueueResult<Option<FileRecord>> {
        let backend = self.backend();
        self.run("find_file", LockScope::Main, move |_| backend.find_file(path))
            .await
    }

    async fn require_file(&self, path: &str) -> QueueResult<FileRecord> {
        self.file(path)
            .await?
            .ok_or_else(|| QueueError::NotFound(format!("file `{path}`")))
    }

    pub async fn queue_record(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Option<QueueRecord>> {
        let backend = self.backend();
        self.run("get_record", LockScope::Main, move |_| {
            backend.get_record(file_id, action_id)
        })
        .await
    }

    /// Status of a file for an action; a missing record reads as Unattempted.
    pub async fn status_of(&self, path: &str, action: &Action) -> QueueResult<QueueStatus> {
        let Some(file) = self.file(path).await? else {
            return Ok(QueueStatus::Unattempted);
        };
        Ok(self
            .queue_record(file.id, action.id)
            .await?
            .map_or(QueueStatus::Unattempted, |record| record.status))
    }

    pub async fn status_history(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Vec<StatusChange>> {
        let backend = self.backend();
        self.run("status_history", LockScope::Main, move |_| {
            backend.status_history(file_id, action_id)
        })
        .await
    }

    /// Deletes the file and all of its queue records. Returns false for unknown paths.
    #[obs]
    pub async fn purge_file(&self, path: &str) -> QueueResult<bool> {
        let Some(file) = self.file(path).await? else {
            return Ok(false);
        };
        let backend = self.backend();
        self.run("purge_file", LockScope::Main, move |_| {
            backend.purge_file(file.id)
        })
        .await
    }

    /// Deleted files stay in the ledger but are never dequeued.
    pub async fn mark_file_deleted(&self, path: &str, deleted: bool) -> QueueResult<()> {
        let file = self.require_file(path).await?;
        let backend = self.backend();
        self.run("set_file_deleted", LockScope::Main, move |_| {
            backend.set_file_deleted(file.id, deleted)
        })
        .await
    }
}
