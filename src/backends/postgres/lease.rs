use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgConnection, Row};
use tracing::debug;

use super::PostgresBackend;
use super::rows::{HistoryEntry, append_history, apply_stat_deltas, lease_from_row};
use crate::backends::base::{LeaseBackend, NewLease, QueueResult};
use crate::ledger::StatDeltas;
use crate::model::{ActionId, FileId, LeaseId, QueueStatus, RevertSummary, WorkerLease};
use crate::observability::obs;

const LEASE_COLUMNS: &str = "id, session_id, machine, process_id, registered_at, last_heartbeat";

/// Returns the lease's Processing records to Pending and deletes the lease.
/// Reverted records keep their sequence so they regain their place in line.
async fn revert_lease_records(
    conn: &mut PgConnection,
    lease_id: LeaseId,
    note: &str,
) -> QueueResult<RevertSummary> {
    let rows = sqlx::query(
        r#"
        WITH held AS (
            SELECT file_id, action_id
            FROM queue_records
            WHERE lease_id = $1 AND status = 'processing'
            FOR UPDATE
        )
        UPDATE queue_records qr
        SET status = 'pending',
            lease_id = NULL,
            updated_at = NOW()
        FROM held
        JOIN files f ON f.id = held.file_id
        JOIN actions a ON a.id = held.action_id
        LEFT JOIN workflows w ON w.id = a.workflow_id
        WHERE qr.file_id = held.file_id AND qr.action_id = held.action_id
        RETURNING qr.file_id, qr.action_id, f.size_bytes,
                  f.page_count::BIGINT AS page_count,
                  COALESCE(w.track_history, FALSE) AS track_history
        "#,
    )
    .bind(lease_id.0)
    .fetch_all(&mut *conn)
    .await?;

    let mut deltas = StatDeltas::default();
    let mut history = Vec::new();
    for row in &rows {
        let file_id = FileId(row.try_get("file_id")?);
        let action_id = ActionId(row.try_get("action_id")?);
        deltas.record(
            action_id,
            Some(QueueStatus::Processing),
            Some(QueueStatus::Pending),
            row.try_get("size_bytes")?,
            row.try_get("page_count")?,
        );
        if row.try_get::<bool, _>("track_history")? {
            history.push(HistoryEntry {
                file_id,
                action_id,
                from: QueueStatus::Processing,
                to: QueueStatus::Pending,
                lease_id: Some(lease_id),
                comment: Some(note.to_string()),
            });
        }
    }
    apply_stat_deltas(conn, &deltas).await?;
    append_history(conn, history).await?;

    // Remaining references on non-processing rows are cleared by ON DELETE SET NULL.
    sqlx::query("DELETE FROM worker_leases WHERE id = $1")
        .bind(lease_id.0)
        .execute(&mut *conn)
        .await?;

    Ok(RevertSummary {
        lease_id,
        records_reverted: rows.len() as u64,
    })
}

impl PostgresBackend {
    #[obs]
    async fn release_lease(
        &self,
        lease_id: LeaseId,
        stale_timeout: Option<Duration>,
    ) -> QueueResult<Option<RevertSummary>> {
        let mut tx = self.pool.begin().await?;
        // A sweeper skips leases another sweeper is already reverting.
        let locked: Option<uuid::Uuid> = match stale_timeout {
            Some(timeout) => {
                sqlx::query_scalar(
                    r#"
                    SELECT id FROM worker_leases
                    WHERE id = $1
                      AND last_heartbeat < NOW() - make_interval(secs => $2)
                    FOR UPDATE SKIP LOCKED
                    "#,
                )
                .bind(lease_id.0)
                .bind(timeout.as_secs_f64())
                .fetch_optional(&mut *tx)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM worker_leases WHERE id = $1 FOR UPDATE")
                    .bind(lease_id.0)
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };
        if locked.is_none() {
            tx.commit().await?;
            debug!(%lease_id, "lease already released or refreshed");
            return Ok(None);
        }

        let note = if stale_timeout.is_some() {
            "lease expired"
        } else {
            "lease released"
        };
        Self::count_query(&self.query_counts, "update:queue_records_revert");
        let summary = revert_lease_records(&mut tx, lease_id, note).await?;
        tx.commit().await?;
        Ok(Some(summary))
    }
}

#[async_trait]
impl LeaseBackend for PostgresBackend {
    async fn register_lease(&self, lease: &NewLease) -> QueueResult<WorkerLease> {
        Self::count_query(&self.query_counts, "insert:worker_leases");
        let sql = format!(
            "INSERT INTO worker_leases (id, session_id, machine, process_id) \
             VALUES ($1, $2, $3, $4) RETURNING {LEASE_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(lease.id.0)
            .bind(lease.session_id)
            .bind(&lease.machine)
            .bind(lease.process_id)
            .fetch_one(&self.pool)
            .await?;
        lease_from_row(&row)
    }

    async fn heartbeat(&self, lease_id: LeaseId) -> QueueResult<bool> {
        Self::count_query(&self.query_counts, "update:worker_leases_heartbeat");
        let result = sqlx::query("UPDATE worker_leases SET last_heartbeat = NOW() WHERE id = $1")
            .bind(lease_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_lease(&self, lease_id: LeaseId) -> QueueResult<Option<WorkerLease>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM worker_leases WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(lease_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lease_from_row).transpose()
    }

    async fn unregister_lease(&self, lease_id: LeaseId) -> QueueResult<Option<RevertSummary>> {
        self.release_lease(lease_id, None).await
    }

    async fn stale_leases(&self, timeout: Duration) -> QueueResult<Vec<WorkerLease>> {
        Self::count_query(&self.query_counts, "select:worker_leases_stale");
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM worker_leases \
             WHERE last_heartbeat < NOW() - make_interval(secs => $1) \
             ORDER BY last_heartbeat"
        );
        let rows = sqlx::query(&sql)
            .bind(timeout.as_secs_f64())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(lease_from_row).collect()
    }

    async fn revert_stale_lease(
        &self,
        lease_id: LeaseId,
        timeout: Duration,
    ) -> QueueResult<Option<RevertSummary>> {
        self.release_lease(lease_id, Some(timeout)).await
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;
    use uuid::Uuid;

    use super::super::test_helpers::setup_backend;
    use super::*;
    use crate::backends::base::{
        DequeueBackend, DequeueClaim, EnqueueFile, LedgerBackend, LockMode, NewAction,
        RegistryBackend,
    };
    use crate::model::{DequeueOrder, QueueMode};

    #[serial(postgres)]
    #[tokio::test]
    async fn stale_lease_revert_returns_work_to_pending() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let action = backend
            .get_or_create_action(
                &NewAction {
                    name: "Extract".into(),
                    workflow_id: None,
                },
                LockMode::Unlocked,
            )
            .await
            .expect("action");
        let enqueued = backend
            .enqueue_file(
                &EnqueueFile {
                    path: "/crash.pdf".into(),
                    size_bytes: Some(10),
                    page_count: Some(1),
                    action_id: action.id,
                    workflow_id: None,
                    priority: None,
                    force: false,
                },
                LockMode::Unlocked,
            )
            .await
            .expect("enqueue");
        let lease = backend
            .register_lease(&NewLease {
                id: LeaseId::new(),
                session_id: Uuid::new_v4(),
                machine: "test".into(),
                process_id: 42,
            })
            .await
            .expect("lease");
        let claimed = backend
            .dequeue(
                &DequeueClaim {
                    action_ids: vec![action.id],
                    lease_id: lease.id,
                    max_count: 1,
                    mode: QueueMode::PendingAnyUser,
                    order: DequeueOrder::Sequence,
                    lease_timeout: Duration::from_secs(300),
                },
                LockMode::Unlocked,
            )
            .await
            .expect("dequeue");
        assert_eq!(claimed.len(), 1);

        // A fresh lease is not reverted.
        let timeout = Duration::from_secs(300);
        assert!(
            backend
                .revert_stale_lease(lease.id, timeout)
                .await
                .expect("fresh revert")
                .is_none()
        );

        sqlx::query(
            "UPDATE worker_leases SET last_heartbeat = NOW() - INTERVAL '10 minutes' WHERE id = $1",
        )
        .bind(lease.id.0)
        .execute(backend.pool())
        .await
        .expect("age lease");
        let stale = backend.stale_leases(timeout).await.expect("stale leases");
        assert_eq!(stale.len(), 1);

        let summary = backend
            .revert_stale_lease(lease.id, timeout)
            .await
            .expect("revert")
            .expect("lease was stale");
        assert_eq!(summary.records_reverted, 1);

        let record = backend
            .get_record(enqueued.file_id, action.id)
            .await
            .expect("record")
            .expect("record exists");
        assert_eq!(record.status, QueueStatus::Pending);
        assert_eq!(record.lease_id, None);
        assert!(backend.get_lease(lease.id).await.expect("lease").is_none());
        assert!(backend.unregister_lease(lease.id).await.expect("again").is_none());
    }
}
