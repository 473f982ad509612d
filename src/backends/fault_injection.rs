//! Memory backend wrapper that fails chosen operations on demand.
//!
//! Used to drive the retry and lock-escalation paths in tests without a
//! database that can be made to deadlock on cue.

use std::collections::{HashMap, VecDeque};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::base::{
    ActionScope, BulkStatusChange, DequeueBackend, DequeueClaim, EnqueueFile, EnqueueOutcome,
    LeaseBackend, LedgerBackend, LockAttempt, LockBackend, LockMode, NewAction, NewLease,
    NewWorkflow, QueueBackend, QueueError, QueueResult, RegistryBackend, StatsBackend,
    StatusTransition, TransitionOutcome,
};
use super::memory::MemoryBackend;
use crate::model::{
    Action, ActionId, ActionStatusCounters, FileId, FileRecord, LeaseId, QueueRecord, QueuedFile,
    RevertSummary, StatusChange, Workflow, WorkflowId, WorkerLease,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Fails like a pool timeout.
    Transient,
    /// Fails like a duplicate-row race.
    Contention,
    /// Fails with an unclassified error.
    Fatal,
}

impl Fault {
    fn into_error(self, operation: &str) -> QueueError {
        match self {
            Fault::Transient => QueueError::Sqlx(sqlx::Error::PoolTimedOut),
            Fault::Contention => QueueError::Contention(format!("injected contention in {operation}")),
            Fault::Fatal => QueueError::Message(format!("injected failure in {operation}")),
        }
    }
}

#[derive(Clone, Default)]
pub struct FaultInjectingBackend {
    inner: MemoryBackend,
    faults: Arc<Mutex<HashMap<&'static str, VecDeque<Fault>>>>,
    calls: Arc<Mutex<Vec<(&'static str, LockMode)>>>,
    lock_acquisitions: Arc<AtomicUsize>,
}

impl FaultInjectingBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Queues `times` failures for the named operation; they fire on its next calls.
    pub fn inject(&self, operation: &'static str, fault: Fault, times: usize) {
        let mut faults = self.faults.lock().expect("faults poisoned");
        let queue = faults.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(fault, times));
    }

    /// Lock modes each mode-aware operation was called with, in call order.
    pub fn calls(&self, operation: &str) -> Vec<LockMode> {
        self.calls
            .lock()
            .expect("calls poisoned")
            .iter()
            .filter(|(name, _)| *name == operation)
            .map(|(_, mode)| *mode)
            .collect()
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.lock_acquisitions.load(AtomicOrdering::SeqCst)
    }

    fn enter(&self, operation: &'static str, mode: Option<LockMode>) -> QueueResult<()> {
        if let Some(mode) = mode {
            self.calls
                .lock()
                .expect("calls poisoned")
                .push((operation, mode));
        }
        let fault = self
            .faults
            .lock()
            .expect("faults poisoned")
            .get_mut(operation)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(fault) => Err(fault.into_error(operation)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LockBackend for FaultInjectingBackend {
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: Uuid,
        expiry: Duration,
    ) -> QueueResult<LockAttempt> {
        self.enter("try_acquire_lock", None)?;
        let attempt = self.inner.try_acquire_lock(name, owner, expiry).await?;
        if !matches!(attempt, LockAttempt::Busy { .. }) {
            self.lock_acquisitions.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(attempt)
    }

    async fn release_lock(&self, name: &str, owner: Uuid) -> QueueResult<bool> {
        self.enter("release_lock", None)?;
        self.inner.release_lock(name, owner).await
    }
}

#[async_trait]
impl RegistryBackend for FaultInjectingBackend {
    async fn get_or_create_workflow(
        &self,
        workflow: &NewWorkflow,
        mode: LockMode,
    ) -> QueueResult<Workflow> {
        self.enter("get_or_create_workflow", Some(mode))?;
        self.inner.get_or_create_workflow(workflow, mode).await
    }

    async fn find_workflow(&self, name: &str) -> QueueResult<Option<Workflow>> {
        self.enter("find_workflow", None)?;
        self.inner.find_workflow(name).await
    }

    async fn list_workflows(&self) -> QueueResult<Vec<Workflow>> {
        self.inner.list_workflows().await
    }

    async fn set_workflow_history(
        &self,
        workflow_id: WorkflowId,
        track_history: bool,
    ) -> QueueResult<()> {
        self.inner
            .set_workflow_history(workflow_id, track_history)
            .await
    }

    async fn get_or_create_action(
        &self,
        action: &NewAction,
        mode: LockMode,
    ) -> QueueResult<Action> {
        self.enter("get_or_create_action", Some(mode))?;
        self.inner.get_or_create_action(action, mode).await
    }

    async fn find_actions(&self, name: &str, scope: ActionScope) -> QueueResult<Vec<Action>> {
        self.enter("find_actions", None)?;
        self.inner.find_actions(name, scope).await
    }

    async fn list_actions(&self, workflow_id: Option<WorkflowId>) -> QueueResult<Vec<Action>> {
        self.inner.list_actions(workflow_id).await
    }
}

#[async_trait]
impl LedgerBackend for FaultInjectingBackend {
    async fn enqueue_file(
        &self,
        request: &EnqueueFile,
        mode: LockMode,
    ) -> QueueResult<EnqueueOutcome> {
        self.enter("enqueue_file", Some(mode))?;
        self.inner.enqueue_file(request, mode).await
    }

    async fn transition(
        &self,
        request: &StatusTransition,
        mode: LockMode,
    ) -> QueueResult<TransitionOutcome> {
        self.enter("transition", Some(mode))?;
        self.inner.transition(request, mode).await
    }

    async fn set_status_for_action(
        &self,
        change: &BulkStatusChange,
        mode: LockMode,
    ) -> QueueResult<u64> {
        self.enter("set_status_for_action", Some(mode))?;
        self.inner.set_status_for_action(change, mode).await
    }

    async fn get_record(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Option<QueueRecord>> {
        self.inner.get_record(file_id, action_id).await
    }

    async fn find_file(&self, path: &str) -> QueueResult<Option<FileRecord>> {
        self.inner.find_file(path).await
    }

    async fn set_file_deleted(&self, file_id: FileId, deleted: bool) -> QueueResult<()> {
        self.inner.set_file_deleted(file_id, deleted).await
    }

    async fn purge_file(&self, file_id: FileId) -> QueueResult<bool> {
        self.enter("purge_file", None)?;
        self.inner.purge_file(file_id).await
    }

    async fn status_history(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Vec<StatusChange>> {
        self.inner.status_history(file_id, action_id).await
    }
}

#[async_trait]
impl DequeueBackend for FaultInjectingBackend {
    async fn dequeue(&self, claim: &DequeueClaim, mode: LockMode) -> QueueResult<Vec<QueuedFile>> {
        self.enter("dequeue", Some(mode))?;
        self.inner.dequeue(claim, mode).await
    }
}

#[async_trait]
impl LeaseBackend for FaultInjectingBackend {
    async fn register_lease(&self, lease: &NewLease) -> QueueResult<WorkerLease> {
        self.enter("register_lease", None)?;
        self.inner.register_lease(lease).await
    }

    async fn heartbeat(&self, lease_id: LeaseId) -> QueueResult<bool> {
        self.enter("heartbeat", None)?;
        self.inner.heartbeat(lease_id).await
    }

    async fn get_lease(&self, lease_id: LeaseId) -> QueueResult<Option<WorkerLease>> {
        self.inner.get_lease(lease_id).await
    }

    async fn unregister_lease(&self, lease_id: LeaseId) -> QueueResult<Option<RevertSummary>> {
        self.enter("unregister_lease", None)?;
        self.inner.unregister_lease(lease_id).await
    }

    async fn stale_leases(&self, timeout: Duration) -> QueueResult<Vec<WorkerLease>> {
        self.enter("stale_leases", None)?;
        self.inner.stale_leases(timeout).await
    }

    async fn revert_stale_lease(
        &self,
        lease_id: LeaseId,
        timeout: Duration,
    ) -> QueueResult<Option<RevertSummary>> {
        self.enter("revert_stale_lease", None)?;
        self.inner.revert_stale_lease(lease_id, timeout).await
    }
}

#[async_trait]
impl StatsBackend for FaultInjectingBackend {
    async fn action_statistics(
        &self,
        action_ids: &[ActionId],
    ) -> QueueResult<Vec<ActionStatusCounters>> {
        self.enter("action_statistics", None)?;
        self.inner.action_statistics(action_ids).await
    }

    async fn recalc_statistics(&self, action_ids: &[ActionId]) -> QueueResult<u64> {
        self.enter("recalc_statistics", None)?;
        self.inner.recalc_statistics(action_ids).await
    }
}

#[async_trait]
impl QueueBackend for FaultInjectingBackend {
    fn name(&self) -> &'static str {
        "fault-injecting"
    }
}
