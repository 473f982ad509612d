//! In-memory backend for tests and single-process runs.
//!
//! All tables live behind one mutex so each trait call is atomic, like a
//! transaction. Get-or-create paths look up and insert in two separate
//! critical sections, so concurrent callers can race the same way they do
//! against Postgres and hit the contention path.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use rand::seq::SliceRandom;
use uuid::Uuid;

use super::base::{
    ActionScope, BulkStatusChange, DequeueBackend, DequeueClaim, EnqueueFile, EnqueueOutcome,
    LeaseBackend, LedgerBackend, LockAttempt, LockBackend, LockMode, NewAction, NewLease,
    NewWorkflow, QueueBackend, QueueError, QueueResult, RegistryBackend, StatsBackend,
    StatusTransition, TransitionOutcome,
};
use crate::ledger::{self, StatDeltas, TransitionPlan};
use crate::model::{
    Action, ActionId, ActionStatusCounters, DequeueOrder, FileId, FileRecord, LeaseId,
    QueueRecord, QueueStatus, QueuedFile, RevertSummary, StatusChange, StatusCounters, Workflow,
    WorkflowId, WorkerLease,
};

/// Heartbeats older than the returned instant belong to stale leases.
fn stale_cutoff(timeout: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    TimeDelta::from_std(timeout)
        .ok()
        .and_then(|timeout| now.checked_sub_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[derive(Clone, Copy, Debug)]
struct HeldLock {
    owner: Uuid,
    acquired_at: DateTime<Utc>,
}

#[derive(Default)]
struct MemoryState {
    next_file_id: i64,
    next_workflow_id: i64,
    next_action_id: i64,
    next_sequence: i64,
    files: BTreeMap<FileId, FileRecord>,
    workflows: BTreeMap<WorkflowId, Workflow>,
    actions: BTreeMap<ActionId, Action>,
    workflow_files: BTreeSet<(WorkflowId, FileId)>,
    records: BTreeMap<(FileId, ActionId), QueueRecord>,
    leases: HashMap<LeaseId, WorkerLease>,
    locks: HashMap<String, HeldLock>,
    statistics: BTreeMap<(ActionId, QueueStatus), StatusCounters>,
    history: Vec<StatusChange>,
}

impl MemoryState {
    fn file_by_path(&self, path: &str) -> Option<&FileRecord> {
        self.files
            .values()
            .find(|file| file.path.eq_ignore_ascii_case(path))
    }

    fn workflow_by_name(&self, name: &str) -> Option<&Workflow> {
        self.workflows
            .values()
            .find(|workflow| workflow.name.eq_ignore_ascii_case(name))
    }

    fn action_by_name(&self, name: &str, workflow_id: Option<WorkflowId>) -> Option<&Action> {
        self.actions
            .values()
            .find(|action| action.workflow_id == workflow_id && action.name.eq_ignore_ascii_case(name))
    }

    fn tracks_history(&self, action_id: ActionId) -> bool {
        self.actions
            .get(&action_id)
            .and_then(|action| action.workflow_id)
            .and_then(|workflow_id| self.workflows.get(&workflow_id))
            .is_some_and(|workflow| workflow.track_history)
    }

    fn file_weight(&self, file_id: FileId) -> (i64, i64) {
        self.files
            .get(&file_id)
            .map_or((0, 0), |file| (file.size_bytes, i64::from(file.page_count)))
    }

    fn lease_protects(&self, lease_id: Option<LeaseId>, stale_before: DateTime<Utc>) -> bool {
        lease_id
            .and_then(|id| self.leases.get(&id))
            .is_some_and(|lease| lease.last_heartbeat > stale_before)
    }

    fn next_sequence(&mut self) -> i64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    fn apply_deltas(&mut self, deltas: &StatDeltas) {
        for (action_id, status, counters) in deltas.iter() {
            self.statistics
                .entry((action_id, status))
                .or_default()
                .merge(&counters);
        }
    }

    /// Writes a planned transition plus its counter and audit side effects.
    fn apply_plan(
        &mut self,
        file_id: FileId,
        action_id: ActionId,
        plan: &TransitionPlan,
        note: Option<&str>,
    ) -> Option<QueueRecord> {
        if !plan.changed {
            return None;
        }
        let now = Utc::now();
        let previous = self.records.get(&(file_id, action_id)).cloned();
        let sequence = match &previous {
            Some(record) if !plan.renew_sequence => record.sequence,
            _ => self.next_sequence(),
        };
        let record = QueueRecord {
            file_id,
            action_id,
            status: plan.to,
            priority: plan.priority,
            sequence,
            lease_id: plan.lease_id,
            comment: plan.comment.clone(),
            skipped_by: plan.skipped_by.clone(),
            updated_at: now,
        };
        self.records.insert((file_id, action_id), record.clone());

        if plan.status_changed() {
            let (bytes, pages) = self.file_weight(file_id);
            let mut deltas = StatDeltas::default();
            deltas.record(action_id, plan.existed.then_some(plan.from), Some(plan.to), bytes, pages);
            self.apply_deltas(&deltas);
            if self.tracks_history(action_id) {
                self.history.push(StatusChange {
                    file_id,
                    action_id,
                    from: plan.from,
                    to: plan.to,
                    lease_id: plan.lease_id.or(previous.and_then(|r| r.lease_id)),
                    comment: note.map(str::to_string).or_else(|| plan.comment.clone()),
                    changed_at: now,
                });
            }
        }
        Some(record)
    }

    fn revert_lease(&mut self, lease_id: LeaseId, note: &str) -> RevertSummary {
        let held: Vec<QueueRecord> = self
            .records
            .values()
            .filter(|record| record.lease_id == Some(lease_id))
            .cloned()
            .collect();
        let mut records_reverted = 0;
        for record in held {
            if record.status == QueueStatus::Processing {
                // Reverted work keeps its original place in the queue.
                let plan = TransitionPlan {
                    from: QueueStatus::Processing,
                    to: QueueStatus::Pending,
                    existed: true,
                    changed: true,
                    priority: record.priority,
                    lease_id: None,
                    comment: None,
                    skipped_by: None,
                    renew_sequence: false,
                };
                self.apply_plan(record.file_id, record.action_id, &plan, Some(note));
                records_reverted += 1;
            } else if let Some(stored) = self.records.get_mut(&(record.file_id, record.action_id)) {
                stored.lease_id = None;
            }
        }
        self.leases.remove(&lease_id);
        RevertSummary {
            lease_id,
            records_reverted,
        }
    }
}

/// Backend that keeps the whole queue in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().expect("memory queue state poisoned")
    }

    /// Moves a lease's last heartbeat, e.g. to simulate a worker that stopped beating.
    pub fn set_last_heartbeat(&self, lease_id: LeaseId, at: DateTime<Utc>) -> bool {
        match self.lock_state().leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.last_heartbeat = at;
                true
            }
            None => false,
        }
    }

    pub fn lock_holder(&self, name: &str) -> Option<Uuid> {
        self.lock_state().locks.get(name).map(|held| held.owner)
    }

    /// Backdates a held lock so the next contender sees it as expired.
    pub fn set_lock_acquired_at(&self, name: &str, at: DateTime<Utc>) -> bool {
        match self.lock_state().locks.get_mut(name) {
            Some(held) => {
                held.acquired_at = at;
                true
            }
            None => false,
        }
    }

    pub fn records(&self) -> Vec<QueueRecord> {
        self.lock_state().records.values().cloned().collect()
    }

    pub fn actions(&self) -> Vec<Action> {
        self.lock_state().actions.values().cloned().collect()
    }
}

#[async_trait]
impl LockBackend for MemoryBackend {
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: Uuid,
        expiry: Duration,
    ) -> QueueResult<LockAttempt> {
        let expiry = TimeDelta::from_std(expiry)
            .map_err(|err| QueueError::InvalidRequest(format!("lock expiry out of range: {err}")))?;
        let now = Utc::now();
        let mut state = self.lock_state();
        let held = state.locks.get(name).copied();
        let attempt = match held {
            None => LockAttempt::Acquired,
            Some(held) if held.owner == owner => LockAttempt::Acquired,
            Some(held) if held.acquired_at <= now - expiry => LockAttempt::Stolen {
                previous_owner: held.owner,
            },
            Some(held) => {
                return Ok(LockAttempt::Busy {
                    owner: Some(held.owner),
                });
            }
        };
        state.locks.insert(
            name.to_string(),
            HeldLock {
                owner,
                acquired_at: now,
            },
        );
        Ok(attempt)
    }

    async fn release_lock(&self, name: &str, owner: Uuid) -> QueueResult<bool> {
        let mut state = self.lock_state();
        match state.locks.get(name) {
            Some(held) if held.owner == owner => {
                state.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RegistryBackend for MemoryBackend {
    async fn get_or_create_workflow(
        &self,
        workflow: &NewWorkflow,
        mode: LockMode,
    ) -> QueueResult<Workflow> {
        let existing = self.lock_state().workflow_by_name(&workflow.name).cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        tokio::task::yield_now().await;

        let mut state = self.lock_state();
        if let Some(existing) = state.workflow_by_name(&workflow.name).cloned() {
            return match mode {
                LockMode::Locked => Ok(existing),
                LockMode::Unlocked => Err(QueueError::Contention(format!(
                    "workflow `{}` was created concurrently",
                    workflow.name
                ))),
            };
        }
        state.next_workflow_id += 1;
        let created = Workflow {
            id: WorkflowId(state.next_workflow_id),
            name: workflow.name.clone(),
            workflow_type: workflow.workflow_type,
            track_history: workflow.track_history,
            created_at: Utc::now(),
        };
        state.workflows.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_workflow(&self, name: &str) -> QueueResult<Option<Workflow>> {
        Ok(self.lock_state().workflow_by_name(name).cloned())
    }

    async fn list_workflows(&self) -> QueueResult<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = self.lock_state().workflows.values().cloned().collect();
        workflows.sort_by_key(|workflow| workflow.name.to_ascii_lowercase());
        Ok(workflows)
    }

    async fn set_workflow_history(
        &self,
        workflow_id: WorkflowId,
        track_history: bool,
    ) -> QueueResult<()> {
        let mut state = self.lock_state();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or_else(|| QueueError::NotFound(format!("workflow {workflow_id}")))?;
        workflow.track_history = track_history;
        Ok(())
    }

    async fn get_or_create_action(
        &self,
        action: &NewAction,
        mode: LockMode,
    ) -> QueueResult<Action> {
        let existing = self
            .lock_state()
            .action_by_name(&action.name, action.workflow_id)
            .cloned();
        if let Some(existing) = existing {
            return Ok(existing);
        }
        tokio::task::yield_now().await;

        let mut state = self.lock_state();
        if let Some(existing) = state.action_by_name(&action.name, action.workflow_id).cloned() {
            return match mode {
                LockMode::Locked => Ok(existing),
                LockMode::Unlocked => Err(QueueError::Contention(format!(
                    "action `{}` was created concurrently",
                    action.name
                ))),
            };
        }
        if let Some(workflow_id) = action.workflow_id
            && !state.workflows.contains_key(&workflow_id)
        {
            return Err(QueueError::NotFound(format!("workflow {workflow_id}")));
        }
        state.next_action_id += 1;
        let created = Action {
            id: ActionId(state.next_action_id),
            name: action.name.clone(),
            workflow_id: action.workflow_id,
        };
        state.actions.insert(created.id, created.clone());
        Ok(created)
    }

    async fn find_actions(&self, name: &str, scope: ActionScope) -> QueueResult<Vec<Action>> {
        let state = self.lock_state();
        Ok(state
            .actions
            .values()
            .filter(|action| action.name.eq_ignore_ascii_case(name))
            .filter(|action| match scope {
                ActionScope::Workflow(workflow_id) => action.workflow_id == Some(workflow_id),
                ActionScope::Global => action.workflow_id.is_none(),
                ActionScope::Any => true,
            })
            .cloned()
            .collect())
    }

    async fn list_actions(&self, workflow_id: Option<WorkflowId>) -> QueueResult<Vec<Action>> {
        let state = self.lock_state();
        Ok(state
            .actions
            .values()
            .filter(|action| workflow_id.is_none() || action.workflow_id == workflow_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LedgerBackend for MemoryBackend {
    async fn enqueue_file(
        &self,
        request: &EnqueueFile,
        mode: LockMode,
    ) -> QueueResult<EnqueueOutcome> {
        let known = self.lock_state().file_by_path(&request.path).map(|file| file.id);
        if known.is_none() {
            tokio::task::yield_now().await;
        }

        let mut state = self.lock_state();
        if !state.actions.contains_key(&request.action_id) {
            return Err(QueueError::NotFound(format!("action {}", request.action_id)));
        }
        let file_id = match known {
            Some(file_id) => file_id,
            None => match state.file_by_path(&request.path).map(|file| file.id) {
                Some(_) if mode == LockMode::Unlocked => {
                    return Err(QueueError::Contention(format!(
                        "file `{}` was created concurrently",
                        request.path
                    )));
                }
                Some(file_id) => file_id,
                None => {
                    state.next_file_id += 1;
                    let file = FileRecord {
                        id: FileId(state.next_file_id),
                        path: request.path.clone(),
                        size_bytes: 0,
                        page_count: 0,
                        deleted: false,
                    };
                    let id = file.id;
                    state.files.insert(id, file);
                    id
                }
            },
        };
        let (old_bytes, old_pages) = state.file_weight(file_id);
        if let Some(file) = state.files.get_mut(&file_id) {
            if let Some(size_bytes) = request.size_bytes {
                file.size_bytes = size_bytes;
            }
            if let Some(page_count) = request.page_count {
                file.page_count = page_count;
            }
        }
        let (new_bytes, new_pages) = state.file_weight(file_id);
        if (new_bytes, new_pages) != (old_bytes, old_pages) {
            let mut deltas = StatDeltas::default();
            for record in state.records.values().filter(|record| record.file_id == file_id) {
                deltas.reweigh(
                    record.action_id,
                    record.status,
                    new_bytes - old_bytes,
                    new_pages - old_pages,
                );
            }
            state.apply_deltas(&deltas);
        }
        if let Some(workflow_id) = request.workflow_id {
            state.workflow_files.insert((workflow_id, file_id));
        }

        let current = state.records.get(&(file_id, request.action_id)).cloned();
        let transition = StatusTransition {
            priority: request.priority,
            force: request.force,
            ..StatusTransition::new(file_id, request.action_id, QueueStatus::Pending)
        };
        let plan = ledger::plan_enqueue(current.as_ref(), &transition)?;
        state.apply_plan(file_id, request.action_id, &plan, None);
        Ok(EnqueueOutcome {
            file_id,
            previous: plan.from,
            status: plan.to,
            queued: plan.to == QueueStatus::Pending,
        })
    }

    async fn transition(
        &self,
        request: &StatusTransition,
        _mode: LockMode,
    ) -> QueueResult<TransitionOutcome> {
        let mut state = self.lock_state();
        if !state.files.contains_key(&request.file_id) {
            return Err(QueueError::NotFound(format!("file {}", request.file_id)));
        }
        if !state.actions.contains_key(&request.action_id) {
            return Err(QueueError::NotFound(format!("action {}", request.action_id)));
        }
        let current = state
            .records
            .get(&(request.file_id, request.action_id))
            .cloned();
        let plan = ledger::plan_transition(current.as_ref(), request)?;
        state.apply_plan(request.file_id, request.action_id, &plan, None);
        Ok(TransitionOutcome {
            previous: plan.from,
            status: plan.to,
            changed: plan.changed,
        })
    }

    async fn set_status_for_action(
        &self,
        change: &BulkStatusChange,
        _mode: LockMode,
    ) -> QueueResult<u64> {
        let mut state = self.lock_state();
        let action = state
            .actions
            .get(&change.action_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(format!("action {}", change.action_id)))?;

        let mut file_ids: BTreeSet<FileId> = state
            .records
            .values()
            .filter(|record| record.action_id == action.id)
            .map(|record| record.file_id)
            .collect();
        if change.to != QueueStatus::Unattempted {
            file_ids.extend(
                state
                    .files
                    .values()
                    .filter(|file| !file.deleted)
                    .filter(|file| match action.workflow_id {
                        Some(workflow_id) => state.workflow_files.contains(&(workflow_id, file.id)),
                        None => true,
                    })
                    .map(|file| file.id),
            );
        }

        let mut changed = 0;
        for file_id in file_ids {
            let current = state.records.get(&(file_id, action.id)).cloned();
            if let Some(record) = &current
                && (record.status == QueueStatus::Processing || record.status == change.to)
            {
                continue;
            }
            let transition = StatusTransition {
                force: true,
                user: change.user.clone(),
                priority: change.priority,
                ..StatusTransition::new(file_id, action.id, change.to)
            };
            let plan = ledger::plan_transition(current.as_ref(), &transition)?;
            if state.apply_plan(file_id, action.id, &plan, None).is_some() {
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn get_record(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Option<QueueRecord>> {
        Ok(self.lock_state().records.get(&(file_id, action_id)).cloned())
    }

    async fn find_file(&self, path: &str) -> QueueResult<Option<FileRecord>> {
        Ok(self.lock_state().file_by_path(path).cloned())
    }

    async fn set_file_deleted(&self, file_id: FileId, deleted: bool) -> QueueResult<()> {
        let mut state = self.lock_state();
        let file = state
            .files
            .get_mut(&file_id)
            .ok_or_else(|| QueueError::NotFound(format!("file {file_id}")))?;
        file.deleted = deleted;
        Ok(())
    }

    async fn purge_file(&self, file_id: FileId) -> QueueResult<bool> {
        let mut state = self.lock_state();
        if !state.files.contains_key(&file_id) {
            return Ok(false);
        }
        let (bytes, pages) = state.file_weight(file_id);
        let removed: Vec<QueueRecord> = state
            .records
            .values()
            .filter(|record| record.file_id == file_id)
            .cloned()
            .collect();
        let mut deltas = StatDeltas::default();
        for record in &removed {
            deltas.record(record.action_id, Some(record.status), None, bytes, pages);
            state.records.remove(&(record.file_id, record.action_id));
        }
        state.apply_deltas(&deltas);
        state.workflow_files.retain(|(_, member)| *member != file_id);
        state.history.retain(|change| change.file_id != file_id);
        state.files.remove(&file_id);
        Ok(true)
    }

    async fn status_history(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Vec<StatusChange>> {
        Ok(self
            .lock_state()
            .history
            .iter()
            .filter(|change| change.file_id == file_id && change.action_id == action_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DequeueBackend for MemoryBackend {
    async fn dequeue(&self, claim: &DequeueClaim, _mode: LockMode) -> QueueResult<Vec<QueuedFile>> {
        let mut state = self.lock_state();
        if !state.leases.contains_key(&claim.lease_id) {
            return Err(QueueError::LeaseLost(claim.lease_id));
        }
        let stale_before = stale_cutoff(claim.lease_timeout);
        let source = claim.mode.source_status();
        let user = claim.mode.user();

        let mut candidates: Vec<QueueRecord> = state
            .records
            .values()
            .filter(|record| claim.action_ids.contains(&record.action_id))
            .filter(|record| record.status == source)
            .filter(|record| user.is_none_or(|user| record.skipped_by.as_deref() == Some(user)))
            .filter(|record| {
                state
                    .files
                    .get(&record.file_id)
                    .is_some_and(|file| !file.deleted)
            })
            .filter(|record| !state.lease_protects(record.lease_id, stale_before))
            .cloned()
            .collect();
        match claim.order {
            DequeueOrder::Sequence => {
                candidates.sort_by_key(|record| (Reverse(record.priority), record.sequence));
            }
            DequeueOrder::Random => {
                candidates.shuffle(&mut rand::thread_rng());
                candidates.sort_by_key(|record| Reverse(record.priority));
            }
        }
        candidates.truncate(claim.max_count);

        let mut claimed = Vec::with_capacity(candidates.len());
        for record in candidates {
            let transition = StatusTransition {
                expected_from: Some(source),
                lease_id: Some(claim.lease_id),
                force: true,
                ..StatusTransition::new(record.file_id, record.action_id, QueueStatus::Processing)
            };
            let plan = ledger::plan_transition(Some(&record), &transition)?;
            state.apply_plan(record.file_id, record.action_id, &plan, None);

            let Some(file) = state.files.get(&record.file_id) else {
                continue;
            };
            let Some(action) = state.actions.get(&record.action_id) else {
                continue;
            };
            claimed.push(QueuedFile {
                file_id: file.id,
                path: file.path.clone(),
                size_bytes: file.size_bytes,
                page_count: file.page_count,
                action_id: action.id,
                action_name: action.name.clone(),
                workflow_id: action.workflow_id,
                priority: record.priority,
                sequence: record.sequence,
                lease_id: claim.lease_id,
            });
        }
        Ok(claimed)
    }
}

#[async_trait]
impl LeaseBackend for MemoryBackend {
    async fn register_lease(&self, lease: &NewLease) -> QueueResult<WorkerLease> {
        let now = Utc::now();
        let registered = WorkerLease {
            id: lease.id,
            session_id: lease.session_id,
            machine: lease.machine.clone(),
            process_id: lease.process_id,
            registered_at: now,
            last_heartbeat: now,
        };
        self.lock_state()
            .leases
            .insert(registered.id, registered.clone());
        Ok(registered)
    }

    async fn heartbeat(&self, lease_id: LeaseId) -> QueueResult<bool> {
        Ok(self.set_last_heartbeat(lease_id, Utc::now()))
    }

    async fn get_lease(&self, lease_id: LeaseId) -> QueueResult<Option<WorkerLease>> {
        Ok(self.lock_state().leases.get(&lease_id).cloned())
    }

    async fn unregister_lease(&self, lease_id: LeaseId) -> QueueResult<Option<RevertSummary>> {
        let mut state = self.lock_state();
        if !state.leases.contains_key(&lease_id) {
            return Ok(None);
        }
        Ok(Some(state.revert_lease(lease_id, "lease released")))
    }

    async fn stale_leases(&self, timeout: Duration) -> QueueResult<Vec<WorkerLease>> {
        let stale_before = stale_cutoff(timeout);
        let mut stale: Vec<WorkerLease> = self
            .lock_state()
            .leases
            .values()
            .filter(|lease| lease.last_heartbeat < stale_before)
            .cloned()
            .collect();
        stale.sort_by_key(|lease| lease.last_heartbeat);
        Ok(stale)
    }

    async fn revert_stale_lease(
        &self,
        lease_id: LeaseId,
        timeout: Duration,
    ) -> QueueResult<Option<RevertSummary>> {
        let stale_before = stale_cutoff(timeout);
        let mut state = self.lock_state();
        let still_stale = state
            .leases
            .get(&lease_id)
            .is_some_and(|lease| lease.last_heartbeat < stale_before);
        if !still_stale {
            return Ok(None);
        }
        Ok(Some(state.revert_lease(lease_id, "lease expired")))
    }
}

#[async_trait]
impl StatsBackend for MemoryBackend {
    async fn action_statistics(
        &self,
        action_ids: &[ActionId],
    ) -> QueueResult<Vec<ActionStatusCounters>> {
        let state = self.lock_state();
        Ok(state
            .statistics
            .iter()
            .filter(|((action_id, _), _)| action_ids.contains(action_id))
            .map(|((action_id, status), counters)| ActionStatusCounters {
                action_id: *action_id,
                status: *status,
                counters: *counters,
            })
            .collect())
    }

    async fn recalc_statistics(&self, action_ids: &[ActionId]) -> QueueResult<u64> {
        let mut state = self.lock_state();
        let in_scope = |action_id: &ActionId| action_ids.is_empty() || action_ids.contains(action_id);
        state
            .statistics
            .retain(|(action_id, _), _| !in_scope(action_id));

        let mut rebuilt: BTreeMap<(ActionId, QueueStatus), StatusCounters> = BTreeMap::new();
        for record in state.records.values().filter(|record| in_scope(&record.action_id)) {
            let (bytes, pages) = state.file_weight(record.file_id);
            rebuilt
                .entry((record.action_id, record.status))
                .or_default()
                .add(1, bytes, pages);
        }
        let written = rebuilt.len() as u64;
        state.statistics.extend(rebuilt);
        Ok(written)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, QueueMode};

    async fn seeded() -> (MemoryBackend, Action) {
        let backend = MemoryBackend::new();
        let action = backend
            .get_or_create_action(
                &NewAction {
                    name: "Extract".into(),
                    workflow_id: None,
                },
                LockMode::Unlocked,
            )
            .await
            .unwrap();
        (backend, action)
    }

    fn enqueue(path: &str, action: &Action, priority: Priority) -> EnqueueFile {
        EnqueueFile {
            path: path.into(),
            size_bytes: Some(100),
            page_count: Some(2),
            action_id: action.id,
            workflow_id: None,
            priority: Some(priority),
            force: false,
        }
    }

    fn claim(action: &Action, lease_id: LeaseId, max_count: usize) -> DequeueClaim {
        DequeueClaim {
            action_ids: vec![action.id],
            lease_id,
            max_count,
            mode: QueueMode::PendingAnyUser,
            order: DequeueOrder::Sequence,
            lease_timeout: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn lock_is_reentrant_and_stealable_after_expiry() {
        let backend = MemoryBackend::new();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let expiry = Duration::from_secs(60);

        assert_eq!(
            backend.try_acquire_lock("main", first, expiry).await.unwrap(),
            LockAttempt::Acquired
        );
        assert_eq!(
            backend.try_acquire_lock("main", first, expiry).await.unwrap(),
            LockAttempt::Acquired
        );
        assert_eq!(
            backend.try_acquire_lock("main", second, expiry).await.unwrap(),
            LockAttempt::Busy { owner: Some(first) }
        );
        assert!(!backend.release_lock("main", second).await.unwrap());

        backend.set_lock_acquired_at("main", Utc::now() - TimeDelta::minutes(5));
        assert_eq!(
            backend.try_acquire_lock("main", second, expiry).await.unwrap(),
            LockAttempt::Stolen {
                previous_owner: first
            }
        );
        assert_eq!(backend.lock_holder("main"), Some(second));
    }

    #[tokio::test]
    async fn dequeue_skips_deleted_files() {
        let (backend, action) = seeded().await;
        let kept = backend
            .enqueue_file(&enqueue("/in/a.pdf", &action, Priority::Normal), LockMode::Unlocked)
            .await
            .unwrap();
        let dropped = backend
            .enqueue_file(&enqueue("/in/b.pdf", &action, Priority::High), LockMode::Unlocked)
            .await
            .unwrap();
        backend.set_file_deleted(dropped.file_id, true).await.unwrap();
        let lease = backend
            .register_lease(&NewLease {
                id: LeaseId::new(),
                session_id: Uuid::new_v4(),
                machine: "test".into(),
                process_id: 1,
            })
            .await
            .unwrap();

        let files = backend
            .dequeue(&claim(&action, lease.id, 10), LockMode::Unlocked)
            .await
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_id, kept.file_id);
    }

    #[tokio::test]
    async fn enqueue_matches_paths_case_insensitively() {
        let (backend, action) = seeded().await;
        let first = backend
            .enqueue_file(&enqueue("/in/Report.PDF", &action, Priority::Low), LockMode::Unlocked)
            .await
            .unwrap();
        let second = backend
            .enqueue_file(&enqueue("/IN/report.pdf", &action, Priority::High), LockMode::Unlocked)
            .await
            .unwrap();
        assert_eq!(first.file_id, second.file_id);
        assert_eq!(second.previous, QueueStatus::Pending);

        let records = backend.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].priority, Priority::High);
    }

    #[tokio::test]
    async fn revert_returns_records_and_keeps_sequence() {
        let (backend, action) = seeded().await;
        backend
            .enqueue_file(&enqueue("/in/a.pdf", &action, Priority::Normal), LockMode::Unlocked)
            .await
            .unwrap();
        let lease = backend
            .register_lease(&NewLease {
                id: LeaseId::new(),
                session_id: Uuid::new_v4(),
                machine: "test".into(),
                process_id: 1,
            })
            .await
            .unwrap();
        let claimed = backend
            .dequeue(&claim(&action, lease.id, 1), LockMode::Unlocked)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let summary = backend.unregister_lease(lease.id).await.unwrap().unwrap();
        assert_eq!(summary.records_reverted, 1);
        assert!(backend.unregister_lease(lease.id).await.unwrap().is_none());

        let record = backend
            .get_record(claimed[0].file_id, action.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, QueueStatus::Pending);
        assert_eq!(record.lease_id, None);
        assert_eq!(record.sequence, claimed[0].sequence);
    }

    #[tokio::test]
    async fn purge_adjusts_statistics() {
        let (backend, action) = seeded().await;
        let outcome = backend
            .enqueue_file(&enqueue("/in/a.pdf", &action, Priority::Normal), LockMode::Unlocked)
            .await
            .unwrap();
        assert!(backend.purge_file(outcome.file_id).await.unwrap());
        assert!(!backend.purge_file(outcome.file_id).await.unwrap());

        let stats = backend.action_statistics(&[action.id]).await.unwrap();
        assert!(stats.iter().all(|row| row.counters.is_zero()));
        assert!(backend.records().is_empty());
    }
}
