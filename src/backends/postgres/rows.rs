//! Row decoding and the write helpers every ledger mutation shares.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Postgres, QueryBuilder, Row};

use crate::backends::base::{LockMode, QueueError, QueueResult};
use crate::ledger::{StatDeltas, TransitionPlan};
use crate::model::{
    Action, ActionId, FileId, FileRecord, LeaseId, Priority, QueueRecord, QueueStatus,
    StatusChange, Workflow, WorkflowId, WorkflowType, WorkerLease,
};

pub(super) const RECORD_COLUMNS: &str = "qr.file_id, qr.action_id, qr.status, qr.priority, \
     qr.sequence, qr.lease_id, qr.comment, qr.skipped_by, qr.updated_at";

pub(super) fn parse_status(value: &str) -> QueueResult<QueueStatus> {
    QueueStatus::parse(value)
        .ok_or_else(|| QueueError::Message(format!("unknown queue status `{value}` in ledger")))
}

pub(super) fn parse_priority(value: i16) -> QueueResult<Priority> {
    Priority::from_i16(value)
        .ok_or_else(|| QueueError::Message(format!("priority {value} out of range in ledger")))
}

pub(super) fn workflow_from_row(row: &PgRow) -> QueueResult<Workflow> {
    let workflow_type: String = row.try_get("workflow_type")?;
    Ok(Workflow {
        id: WorkflowId(row.try_get("id")?),
        name: row.try_get("name")?,
        workflow_type: WorkflowType::parse(&workflow_type).unwrap_or_default(),
        track_history: row.try_get("track_history")?,
        created_at: row.try_get("created_at")?,
    })
}

pub(super) fn action_from_row(row: &PgRow) -> QueueResult<Action> {
    let workflow_id: Option<i64> = row.try_get("workflow_id")?;
    Ok(Action {
        id: ActionId(row.try_get("id")?),
        name: row.try_get("name")?,
        workflow_id: workflow_id.map(WorkflowId),
    })
}

pub(super) fn file_from_row(row: &PgRow) -> QueueResult<FileRecord> {
    Ok(FileRecord {
        id: FileId(row.try_get("id")?),
        path: row.try_get("path")?,
        size_bytes: row.try_get("size_bytes")?,
        page_count: row.try_get("page_count")?,
        deleted: row.try_get("deleted")?,
    })
}

pub(super) fn record_from_row(row: &PgRow) -> QueueResult<QueueRecord> {
    let status: String = row.try_get("status")?;
    let lease_id: Option<uuid::Uuid> = row.try_get("lease_id")?;
    Ok(QueueRecord {
        file_id: FileId(row.try_get("file_id")?),
        action_id: ActionId(row.try_get("action_id")?),
        status: parse_status(&status)?,
        priority: parse_priority(row.try_get("priority")?)?,
        sequence: row.try_get("sequence")?,
        lease_id: lease_id.map(LeaseId),
        comment: row.try_get("comment")?,
        skipped_by: row.try_get("skipped_by")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(super) fn lease_from_row(row: &PgRow) -> QueueResult<WorkerLease> {
    Ok(WorkerLease {
        id: LeaseId(row.try_get("id")?),
        session_id: row.try_get("session_id")?,
        machine: row.try_get("machine")?,
        process_id: row.try_get("process_id")?,
        registered_at: row.try_get("registered_at")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
    })
}

pub(super) fn history_from_row(row: &PgRow) -> QueueResult<StatusChange> {
    let from: String = row.try_get("from_status")?;
    let to: String = row.try_get("to_status")?;
    let lease_id: Option<uuid::Uuid> = row.try_get("lease_id")?;
    Ok(StatusChange {
        file_id: FileId(row.try_get("file_id")?),
        action_id: ActionId(row.try_get("action_id")?),
        from: parse_status(&from)?,
        to: parse_status(&to)?,
        lease_id: lease_id.map(LeaseId),
        comment: row.try_get("comment")?,
        changed_at: row.try_get("changed_at")?,
    })
}

/// Size, pages and audit setting for one (file, action) pair.
pub(super) struct RecordContext {
    pub size_bytes: i64,
    pub page_count: i64,
    pub track_history: bool,
}

pub(super) async fn load_record_context(
    conn: &mut PgConnection,
    file_id: FileId,
    action_id: ActionId,
) -> QueueResult<RecordContext> {
    let row = sqlx::query(
        r#"
        SELECT f.size_bytes,
               f.page_count::BIGINT AS page_count,
               COALESCE(w.track_history, FALSE) AS track_history
        FROM files f
        CROSS JOIN actions a
        LEFT JOIN workflows w ON w.id = a.workflow_id
        WHERE f.id = $1 AND a.id = $2
        "#,
    )
    .bind(file_id.0)
    .bind(action_id.0)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| QueueError::NotFound(format!("file {file_id} or action {action_id}")))?;
    Ok(RecordContext {
        size_bytes: row.try_get("size_bytes")?,
        page_count: row.try_get("page_count")?,
        track_history: row.try_get("track_history")?,
    })
}

/// Row-lock clause for single-record writes. Optimistic callers refuse to wait
/// so a busy row surfaces as contention and the call is retried under the lock.
pub(super) fn row_lock_clause(mode: LockMode) -> &'static str {
    match mode {
        LockMode::Unlocked => "FOR UPDATE NOWAIT",
        LockMode::Locked => "FOR UPDATE",
    }
}

pub(super) async fn load_record_for_update(
    conn: &mut PgConnection,
    file_id: FileId,
    action_id: ActionId,
    mode: LockMode,
) -> QueueResult<Option<QueueRecord>> {
    let sql = format!(
        "SELECT {RECORD_COLUMNS} FROM queue_records qr \
         WHERE qr.file_id = $1 AND qr.action_id = $2 {}",
        row_lock_clause(mode)
    );
    let row = sqlx::query(&sql)
        .bind(file_id.0)
        .bind(action_id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

pub(super) struct HistoryEntry {
    pub file_id: FileId,
    pub action_id: ActionId,
    pub from: QueueStatus,
    pub to: QueueStatus,
    pub lease_id: Option<LeaseId>,
    pub comment: Option<String>,
}

pub(super) async fn append_history(
    conn: &mut PgConnection,
    entries: Vec<HistoryEntry>,
) -> QueueResult<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO queue_status_history (file_id, action_id, from_status, to_status, lease_id, comment) ",
    );
    builder.push_values(entries, |mut b, entry| {
        b.push_bind(entry.file_id.0)
            .push_bind(entry.action_id.0)
            .push_bind(entry.from.as_str())
            .push_bind(entry.to.as_str())
            .push_bind(entry.lease_id.map(|lease| lease.0))
            .push_bind(entry.comment);
    });
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

pub(super) async fn apply_stat_deltas(
    conn: &mut PgConnection,
    deltas: &StatDeltas,
) -> QueueResult<()> {
    if deltas.is_empty() {
        return Ok(());
    }
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO action_statistics (action_id, status, file_count, byte_count, page_count) ",
    );
    builder.push_values(deltas.iter(), |mut b, (action_id, status, counters)| {
        b.push_bind(action_id.0)
            .push_bind(status.as_str())
            .push_bind(counters.files)
            .push_bind(counters.bytes)
            .push_bind(counters.pages);
    });
    builder.push(
        r#"
        ON CONFLICT (action_id, status) DO UPDATE
        SET file_count = action_statistics.file_count + EXCLUDED.file_count,
            byte_count = action_statistics.byte_count + EXCLUDED.byte_count,
            page_count = action_statistics.page_count + EXCLUDED.page_count
        "#,
    );
    builder.build().execute(&mut *conn).await?;
    Ok(())
}

/// Writes a planned transition with its counter and audit side effects.
pub(super) async fn write_plan(
    conn: &mut PgConnection,
    file_id: FileId,
    action_id: ActionId,
    plan: &TransitionPlan,
    previous_lease: Option<LeaseId>,
    context: &RecordContext,
) -> QueueResult<()> {
    if !plan.changed {
        return Ok(());
    }
    if plan.existed {
        sqlx::query(
            r#"
            UPDATE queue_records
            SET status = $3,
                priority = $4,
                lease_id = $5,
                comment = $6,
                skipped_by = $7,
                sequence = CASE WHEN $8 THEN nextval('queue_sequence') ELSE sequence END,
                updated_at = NOW()
            WHERE file_id = $1 AND action_id = $2
            "#,
        )
        .bind(file_id.0)
        .bind(action_id.0)
        .bind(plan.to.as_str())
        .bind(plan.priority.as_i16())
        .bind(plan.lease_id.map(|lease| lease.0))
        .bind(plan.comment.as_deref())
        .bind(plan.skipped_by.as_deref())
        .bind(plan.renew_sequence)
        .execute(&mut *conn)
        .await?;
    } else {
        sqlx::query(
            r#"
            INSERT INTO queue_records (file_id, action_id, status, priority, lease_id, comment, skipped_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(file_id.0)
        .bind(action_id.0)
        .bind(plan.to.as_str())
        .bind(plan.priority.as_i16())
        .bind(plan.lease_id.map(|lease| lease.0))
        .bind(plan.comment.as_deref())
        .bind(plan.skipped_by.as_deref())
        .execute(&mut *conn)
        .await?;
    }

    if plan.status_changed() {
        let mut deltas = StatDeltas::default();
        deltas.record(
            action_id,
            plan.existed.then_some(plan.from),
            Some(plan.to),
            context.size_bytes,
            context.page_count,
        );
        apply_stat_deltas(conn, &deltas).await?;
        if context.track_history {
            append_history(
                conn,
                vec![HistoryEntry {
                    file_id,
                    action_id,
                    from: plan.from,
                    to: plan.to,
                    lease_id: plan.lease_id.or(previous_lease),
                    comment: plan.comment.clone(),
                }],
            )
            .await?;
        }
    }
    Ok(())
}
