//! Backend interfaces for the queue ledger, registry, leases and advisory locks.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    Action, ActionId, ActionStatusCounters, DequeueOrder, FileId, FileRecord, LeaseId, Priority,
    QueueMode, QueueRecord, QueueStatus, QueuedFile, RevertSummary, StatusChange, Workflow,
    WorkflowId, WorkflowType, WorkerLease,
};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("contention: {0}")]
    Contention(String),
    #[error("advisory lock `{name}` still held by {holder} after {waited_ms} ms")]
    LockTimeout {
        name: String,
        holder: String,
        waited_ms: u64,
    },
    #[error(
        "status mismatch for file {file_id} action {action_id}: expected {expected}, found {actual}"
    )]
    StatusMismatch {
        file_id: FileId,
        action_id: ActionId,
        expected: QueueStatus,
        actual: QueueStatus,
    },
    #[error("transition {from} -> {to} is not allowed for file {file_id} action {action_id}")]
    InvalidTransition {
        file_id: FileId,
        action_id: ActionId,
        from: QueueStatus,
        to: QueueStatus,
    },
    #[error("file {file_id} action {action_id} is not held by lease {lease_id}")]
    LeaseMismatch {
        file_id: FileId,
        action_id: ActionId,
        lease_id: LeaseId,
    },
    #[error("worker lease {0} is no longer registered; register the worker again")]
    LeaseLost(LeaseId),
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Coarse classification that drives the retry combinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Duplicate-row races and lock timeouts; re-run under the advisory lock.
    Contention,
    /// Deadlocks, serialization failures and dropped connections; retried with backoff.
    Transient,
    /// The ledger did not match the caller's expectation; re-run once under the lock.
    Invariant,
    /// Missing workflow/action or a malformed request; surfaced immediately.
    Configuration,
    Other,
}

impl QueueError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Contention(_) | QueueError::LockTimeout { .. } => ErrorKind::Contention,
            QueueError::StatusMismatch { .. }
            | QueueError::InvalidTransition { .. }
            | QueueError::LeaseMismatch { .. } => ErrorKind::Invariant,
            QueueError::Configuration(_)
            | QueueError::LeaseLost(_)
            | QueueError::NotFound(_)
            | QueueError::InvalidRequest(_) => ErrorKind::Configuration,
            QueueError::Sqlx(err) => classify_sqlx(err),
            QueueError::Migrate(_) | QueueError::Message(_) => ErrorKind::Other,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Contention and invariant violations are worth one more attempt under the lock.
    pub fn escalates(&self) -> bool {
        matches!(self.kind(), ErrorKind::Contention | ErrorKind::Invariant)
    }
}

pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err).as_deref() == Some("23505")
}

fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    if let Some(code) = sqlstate(err) {
        return match code.as_str() {
            // deadlock_detected, serialization_failure
            "40P01" | "40001" => ErrorKind::Transient,
            // unique_violation, lock_not_available
            "23505" | "55P03" => ErrorKind::Contention,
            // connection_exception class, admin_shutdown, cannot_connect_now
            code if code.starts_with("08") => ErrorKind::Transient,
            "57P01" | "57P03" => ErrorKind::Transient,
            _ => ErrorKind::Other,
        };
    }
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Transient,
        _ => ErrorKind::Other,
    }
}

/// Whether an operation runs optimistically or while holding its advisory lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Locked,
}

/// Result of one attempt to take a named advisory lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    /// The previous holder's row had expired and now belongs to the caller.
    Stolen { previous_owner: Uuid },
    Busy { owner: Option<Uuid> },
}

#[derive(Clone, Debug)]
pub struct NewWorkflow {
    pub name: String,
    pub workflow_type: WorkflowType,
    pub track_history: bool,
}

#[derive(Clone, Debug)]
pub struct NewAction {
    pub name: String,
    pub workflow_id: Option<WorkflowId>,
}

/// Which actions a name lookup may match.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionScope {
    Workflow(WorkflowId),
    /// Legacy actions with no workflow.
    Global,
    /// Every action with the name, across all workflows and the legacy scope.
    Any,
}

/// Put a file on an action's queue, creating the file row on first reference.
#[derive(Clone, Debug)]
pub struct EnqueueFile {
    pub path: String,
    pub size_bytes: Option<i64>,
    pub page_count: Option<i32>,
    pub action_id: ActionId,
    pub workflow_id: Option<WorkflowId>,
    pub priority: Option<Priority>,
    /// Re-queue even when the record is currently Processing.
    pub force: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub file_id: FileId,
    pub previous: QueueStatus,
    pub status: QueueStatus,
    pub queued: bool,
}

/// Move one queue record to a new status.
#[derive(Clone, Debug)]
pub struct StatusTransition {
    pub file_id: FileId,
    pub action_id: ActionId,
    pub to: QueueStatus,
    /// Rejected unless the ledger holds this status at write time.
    pub expected_from: Option<QueueStatus>,
    /// Skip edge, expectation and lease checks.
    pub force: bool,
    /// The caller's lease; checked when the record is Processing.
    pub lease_id: Option<LeaseId>,
    pub comment: Option<String>,
    pub user: Option<String>,
    pub priority: Option<Priority>,
}

impl StatusTransition {
    pub fn new(file_id: FileId, action_id: ActionId, to: QueueStatus) -> Self {
        Self {
            file_id,
            action_id,
            to,
            expected_from: None,
            force: false,
            lease_id: None,
            comment: None,
            user: None,
            priority: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub previous: QueueStatus,
    pub status: QueueStatus,
    pub changed: bool,
}

/// Set every file of one action's workflow to a status.
#[derive(Clone, Debug)]
pub struct BulkStatusChange {
    pub action_id: ActionId,
    pub to: QueueStatus,
    pub user: Option<String>,
    pub priority: Option<Priority>,
}

/// Claim settings for one dequeue call.
#[derive(Clone, Debug)]
pub struct DequeueClaim {
    pub action_ids: Vec<ActionId>,
    pub lease_id: LeaseId,
    pub max_count: usize,
    pub mode: QueueMode,
    pub order: DequeueOrder,
    /// Leases silent for longer than this no longer protect their rows.
    pub lease_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct NewLease {
    pub id: LeaseId,
    pub session_id: Uuid,
    pub machine: String,
    pub process_id: i64,
}

/// Named advisory locks stored as rows keyed by name.
#[async_trait]
pub trait LockBackend: Send + Sync {
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: Uuid,
        expiry: Duration,
    ) -> QueueResult<LockAttempt>;

    /// Returns false when the caller did not hold the lock.
    async fn release_lock(&self, name: &str, owner: Uuid) -> QueueResult<bool>;
}

/// Workflow and action registry.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    async fn get_or_create_workflow(
        &self,
        workflow: &NewWorkflow,
        mode: LockMode,
    ) -> QueueResult<Workflow>;

    async fn find_workflow(&self, name: &str) -> QueueResult<Option<Workflow>>;

    async fn list_workflows(&self) -> QueueResult<Vec<Workflow>>;

    async fn set_workflow_history(
        &self,
        workflow_id: WorkflowId,
        track_history: bool,
    ) -> QueueResult<()>;

    async fn get_or_create_action(&self, action: &NewAction, mode: LockMode)
    -> QueueResult<Action>;

    async fn find_actions(&self, name: &str, scope: ActionScope) -> QueueResult<Vec<Action>>;

    async fn list_actions(&self, workflow_id: Option<WorkflowId>) -> QueueResult<Vec<Action>>;
}

/// Per (file, action) status ledger.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    async fn enqueue_file(&self, request: &EnqueueFile, mode: LockMode)
    -> QueueResult<EnqueueOutcome>;

    async fn transition(
        &self,
        request: &StatusTransition,
        mode: LockMode,
    ) -> QueueResult<TransitionOutcome>;

    /// Returns how many records changed.
    async fn set_status_for_action(
        &self,
        change: &BulkStatusChange,
        mode: LockMode,
    ) -> QueueResult<u64>;

    async fn get_record(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Option<QueueRecord>>;

    async fn find_file(&self, path: &str) -> QueueResult<Option<FileRecord>>;

    async fn set_file_deleted(&self, file_id: FileId, deleted: bool) -> QueueResult<()>;

    /// Removes the file and all of its queue records. Returns false if it did not exist.
    async fn purge_file(&self, file_id: FileId) -> QueueResult<bool>;

    async fn status_history(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Vec<StatusChange>>;
}

#[async_trait]
pub trait DequeueBackend: Send + Sync {
    async fn dequeue(&self, claim: &DequeueClaim, mode: LockMode) -> QueueResult<Vec<QueuedFile>>;
}

/// Worker leases and the revert of work held by dead leases.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    async fn register_lease(&self, lease: &NewLease) -> QueueResult<WorkerLease>;

    /// Returns false once the lease row is gone.
    async fn heartbeat(&self, lease_id: LeaseId) -> QueueResult<bool>;

    async fn get_lease(&self, lease_id: LeaseId) -> QueueResult<Option<WorkerLease>>;

    /// Deletes the lease and reverts its Processing records; `None` if it was already gone.
    async fn unregister_lease(&self, lease_id: LeaseId) -> QueueResult<Option<RevertSummary>>;

    /// Leases whose last heartbeat is older than `timeout`, measured on the
    /// backend's own clock.
    async fn stale_leases(&self, timeout: Duration) -> QueueResult<Vec<WorkerLease>>;

    /// Like `unregister_lease`, but only while the lease is still stale and not
    /// being reverted by someone else.
    async fn revert_stale_lease(
        &self,
        lease_id: LeaseId,
        timeout: Duration,
    ) -> QueueResult<Option<RevertSummary>>;
}

#[async_trait]
pub trait StatsBackend: Send + Sync {
    async fn action_statistics(
        &self,
        action_ids: &[ActionId],
    ) -> QueueResult<Vec<ActionStatusCounters>>;

    /// Rebuilds counters from the ledger. An empty slice means every action.
    /// Returns the number of counter rows written.
    async fn recalc_statistics(&self, action_ids: &[ActionId]) -> QueueResult<u64>;
}

/// Everything a queue context needs from its store.
#[async_trait]
pub trait QueueBackend:
    LockBackend + RegistryBackend + LedgerBackend + DequeueBackend + LeaseBackend + StatsBackend
{
    fn name(&self) -> &'static str;

    async fn close(&self) {}
}
