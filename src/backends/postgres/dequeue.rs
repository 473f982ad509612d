use async_trait::async_trait;
use sqlx::Row;

use super::PostgresBackend;
use super::rows::{HistoryEntry, append_history, apply_stat_deltas, parse_priority};
use crate::backends::base::{DequeueBackend, DequeueClaim, LockMode, QueueError, QueueResult};
use crate::ledger::StatDeltas;
use crate::model::{ActionId, DequeueOrder, FileId, QueueStatus, QueuedFile, WorkflowId};
use crate::observability::obs;

impl PostgresBackend {
    /// Claim up to `max_count` records for the caller's lease in one statement.
    ///
    /// Optimistic claims skip rows another worker is locking; claims made under
    /// the advisory lock wait for them instead. The caller's lease must still be
    /// registered; a swept lease yields `LeaseLost` instead of orphaned claims.
    #[obs]
    async fn claim_records(
        &self,
        claim: &DequeueClaim,
        mode: LockMode,
    ) -> QueueResult<Vec<QueuedFile>> {
        if claim.max_count == 0 || claim.action_ids.is_empty() {
            return Ok(Vec::new());
        }
        let source = claim.mode.source_status();
        let order_clause = match claim.order {
            DequeueOrder::Sequence => "qr.priority DESC, qr.sequence",
            DequeueOrder::Random => "qr.priority DESC, random()",
        };
        let lock_clause = match mode {
            LockMode::Unlocked => "FOR UPDATE OF qr SKIP LOCKED",
            LockMode::Locked => "FOR UPDATE OF qr",
        };
        let sql = format!(
            r#"
            WITH candidates AS (
                SELECT qr.file_id, qr.action_id
                FROM queue_records qr
                JOIN files f ON f.id = qr.file_id
                WHERE qr.action_id = ANY($1)
                  AND qr.status = $2
                  AND ($3::TEXT IS NULL OR qr.skipped_by = $3)
                  AND NOT f.deleted
                  AND NOT EXISTS (
                      SELECT 1 FROM worker_leases wl
                      WHERE wl.id = qr.lease_id
                        AND wl.last_heartbeat > NOW() - make_interval(secs => $4)
                  )
                ORDER BY {order_clause}
                LIMIT $5
                {lock_clause}
            ),
            claimed AS (
                UPDATE queue_records qr
                SET status = 'processing',
                    lease_id = $6,
                    comment = NULL,
                    skipped_by = NULL,
                    updated_at = NOW()
                FROM candidates c
                WHERE qr.file_id = c.file_id AND qr.action_id = c.action_id
                RETURNING qr.file_id, qr.action_id, qr.priority, qr.sequence
            )
            SELECT c.file_id, c.action_id, c.priority, c.sequence,
                   f.path, f.size_bytes, f.page_count,
                   a.name AS action_name, a.workflow_id,
                   COALESCE(w.track_history, FALSE) AS track_history
            FROM claimed c
            JOIN files f ON f.id = c.file_id
            JOIN actions a ON a.id = c.action_id
            LEFT JOIN workflows w ON w.id = a.workflow_id
            ORDER BY c.priority DESC, c.sequence
            "#
        );
        let action_ids: Vec<i64> = claim.action_ids.iter().map(|id| id.0).collect();

        let mut tx = self.pool.begin().await?;
        // Holding the lease row blocks a concurrent sweep from deleting it mid-claim.
        Self::count_query(&self.query_counts, "select:worker_leases_claimant");
        let registered: Option<uuid::Uuid> =
            sqlx::query_scalar("SELECT id FROM worker_leases WHERE id = $1 FOR SHARE")
                .bind(claim.lease_id.0)
                .fetch_optional(&mut *tx)
                .await?;
        if registered.is_none() {
            tx.rollback().await?;
            return Err(QueueError::LeaseLost(claim.lease_id));
        }
        Self::count_query(&self.query_counts, "update:queue_records_claim");
        let rows = sqlx::query(&sql)
            .bind(&action_ids)
            .bind(source.as_str())
            .bind(claim.mode.user())
            .bind(claim.lease_timeout.as_secs_f64())
            .bind(claim.max_count as i64)
            .bind(claim.lease_id.0)
            .fetch_all(&mut *tx)
            .await?;

        let mut claimed = Vec::with_capacity(rows.len());
        let mut deltas = StatDeltas::default();
        let mut history = Vec::new();
        for row in &rows {
            let workflow_id: Option<i64> = row.try_get("workflow_id")?;
            let file = QueuedFile {
                file_id: FileId(row.try_get("file_id")?),
                path: row.try_get("path")?,
                size_bytes: row.try_get("size_bytes")?,
                page_count: row.try_get("page_count")?,
                action_id: ActionId(row.try_get("action_id")?),
                action_name: row.try_get("action_name")?,
                workflow_id: workflow_id.map(WorkflowId),
                priority: parse_priority(row.try_get("priority")?)?,
                sequence: row.try_get("sequence")?,
                lease_id: claim.lease_id,
            };
            deltas.record(
                file.action_id,
                Some(source),
                Some(QueueStatus::Processing),
                file.size_bytes,
                i64::from(file.page_count),
            );
            if row.try_get::<bool, _>("track_history")? {
                history.push(HistoryEntry {
                    file_id: file.file_id,
                    action_id: file.action_id,
                    from: source,
                    to: QueueStatus::Processing,
                    lease_id: Some(claim.lease_id),
                    comment: None,
                });
            }
            claimed.push(file);
        }
        apply_stat_deltas(&mut tx, &deltas).await?;
        append_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok(claimed)
    }
}

#[async_trait]
impl DequeueBackend for PostgresBackend {
    async fn dequeue(&self, claim: &DequeueClaim, mode: LockMode) -> QueueResult<Vec<QueuedFile>> {
        self.claim_records(claim, mode).await
    }
}
