//! Status-transition planning shared by every backend.
//!
//! Backends load the current record under a row lock, ask this module what the
//! record should become, then write the plan and its statistics deltas in the
//! same transaction.

use std::collections::BTreeMap;

use crate::backends::{QueueError, QueueResult, StatusTransition};
use crate::model::{ActionId, LeaseId, Priority, QueueRecord, QueueStatus, StatusCounters};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionPlan {
    pub from: QueueStatus,
    pub to: QueueStatus,
    /// False when the record does not exist yet and must be inserted.
    pub existed: bool,
    /// False when nothing needs writing.
    pub changed: bool,
    pub priority: Priority,
    pub lease_id: Option<LeaseId>,
    pub comment: Option<String>,
    pub skipped_by: Option<String>,
    pub renew_sequence: bool,
}

impl TransitionPlan {
    /// Whether the status itself moves, as opposed to a priority-only update.
    pub fn status_changed(&self) -> bool {
        (self.existed && self.from != self.to) || (!self.existed && self.changed)
    }
}

pub fn plan_transition(
    current: Option<&QueueRecord>,
    request: &StatusTransition,
) -> QueueResult<TransitionPlan> {
    let from = current.map_or(QueueStatus::Unattempted, |record| record.status);
    let to = request.to;

    if !request.force {
        if let Some(expected) = request.expected_from
            && expected != from
        {
            return Err(QueueError::StatusMismatch {
                file_id: request.file_id,
                action_id: request.action_id,
                expected,
                actual: from,
            });
        }
        if from == QueueStatus::Processing
            && let (Some(held_by), Some(caller)) = (current.and_then(|r| r.lease_id), request.lease_id)
            && held_by != caller
        {
            return Err(QueueError::LeaseMismatch {
                file_id: request.file_id,
                action_id: request.action_id,
                lease_id: caller,
            });
        }
    }

    let current_priority = current.map(|record| record.priority);
    let priority = request
        .priority
        .or(current_priority)
        .unwrap_or_default();

    if from == to && current.is_some() {
        return Ok(TransitionPlan {
            from,
            to,
            existed: true,
            changed: current_priority != Some(priority),
            priority,
            lease_id: current.and_then(|r| r.lease_id),
            comment: current.and_then(|r| r.comment.clone()),
            skipped_by: current.and_then(|r| r.skipped_by.clone()),
            renew_sequence: false,
        });
    }

    if !request.force && !from.can_transition_to(to) {
        return Err(QueueError::InvalidTransition {
            file_id: request.file_id,
            action_id: request.action_id,
            from,
            to,
        });
    }

    Ok(TransitionPlan {
        from,
        to,
        existed: current.is_some(),
        changed: true,
        priority,
        lease_id: if to == QueueStatus::Processing {
            request.lease_id
        } else {
            None
        },
        comment: match to {
            QueueStatus::Failed | QueueStatus::Skipped => request.comment.clone(),
            _ => None,
        },
        skipped_by: if to == QueueStatus::Skipped {
            request.user.clone()
        } else {
            None
        },
        renew_sequence: to == QueueStatus::Pending,
    })
}

/// Plan for putting a record on the queue. Pending records only pick up the new
/// priority; Processing records stay with their worker unless forced.
pub fn plan_enqueue(
    current: Option<&QueueRecord>,
    request: &StatusTransition,
) -> QueueResult<TransitionPlan> {
    if let Some(record) = current
        && record.status == QueueStatus::Processing
        && !request.force
    {
        return Ok(TransitionPlan {
            from: record.status,
            to: record.status,
            existed: true,
            changed: false,
            priority: record.priority,
            lease_id: record.lease_id,
            comment: record.comment.clone(),
            skipped_by: record.skipped_by.clone(),
            renew_sequence: false,
        });
    }
    let mut request = request.clone();
    request.to = QueueStatus::Pending;
    request.expected_from = None;
    request.force = true;
    plan_transition(current, &request)
}

/// Incremental (action, status) counter adjustments accumulated inside one transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatDeltas {
    entries: BTreeMap<(ActionId, QueueStatus), StatusCounters>,
}

impl StatDeltas {
    pub fn record(
        &mut self,
        action_id: ActionId,
        from: Option<QueueStatus>,
        to: Option<QueueStatus>,
        bytes: i64,
        pages: i64,
    ) {
        if from == to {
            return;
        }
        if let Some(from) = from {
            self.entries
                .entry((action_id, from))
                .or_default()
                .add(-1, bytes, pages);
        }
        if let Some(to) = to {
            self.entries
                .entry((action_id, to))
                .or_default()
                .add(1, bytes, pages);
        }
    }

    /// Weight correction for a record that keeps its status while its file's
    /// size or page count changes.
    pub fn reweigh(
        &mut self,
        action_id: ActionId,
        status: QueueStatus,
        bytes_delta: i64,
        pages_delta: i64,
    ) {
        self.entries
            .entry((action_id, status))
            .or_default()
            .add(0, bytes_delta, pages_delta);
    }

    /// Entries in (action, status) order so concurrent writers lock counter rows
    /// in the same sequence.
    pub fn iter(&self) -> impl Iterator<Item = (ActionId, QueueStatus, StatusCounters)> + '_ {
        self.entries
            .iter()
            .filter(|(_, counters)| !counters.is_zero())
            .map(|((action_id, status), counters)| (*action_id, *status, *counters))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}
