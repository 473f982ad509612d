use async_trait::async_trait;
use sqlx::{PgConnection, Row};

use super::PostgresBackend;
use super::rows::{
    HistoryEntry, RECORD_COLUMNS, RecordContext, append_history, apply_stat_deltas,
    file_from_row, history_from_row, load_record_context, load_record_for_update, parse_status,
    record_from_row, write_plan,
};
use crate::backends::base::{
    BulkStatusChange, EnqueueFile, EnqueueOutcome, LedgerBackend, LockMode, QueueError,
    QueueResult, StatusTransition, TransitionOutcome,
};
use crate::ledger::{self, StatDeltas};
use crate::model::{ActionId, FileId, FileRecord, QueueRecord, QueueStatus, StatusChange};
use crate::observability::obs;

impl PostgresBackend {
    /// Finds the file by path or inserts it. Without the advisory lock a
    /// concurrent insert of the same path fails with a unique violation, which
    /// classifies as contention.
    async fn file_id_for_path(
        &self,
        conn: &mut PgConnection,
        request: &EnqueueFile,
        mode: LockMode,
    ) -> QueueResult<FileId> {
        Self::count_query(&self.query_counts, "select:file_by_path");
        let existing: Option<i64> =
            sqlx::query_scalar("SELECT id FROM files WHERE lower(path) = lower($1)")
                .bind(&request.path)
                .fetch_optional(&mut *conn)
                .await?;
        if let Some(id) = existing {
            return Ok(FileId(id));
        }

        let conflict = match mode {
            LockMode::Unlocked => "",
            LockMode::Locked => "ON CONFLICT ((lower(path))) DO NOTHING",
        };
        let sql = format!(
            "INSERT INTO files (path, size_bytes, page_count) VALUES ($1, $2, $3) {conflict} RETURNING id"
        );
        Self::count_query(&self.query_counts, "insert:files");
        let inserted: Option<i64> = sqlx::query_scalar(&sql)
            .bind(&request.path)
            .bind(request.size_bytes.unwrap_or(0))
            .bind(request.page_count.unwrap_or(0))
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(id) = inserted {
            return Ok(FileId(id));
        }
        let raced: Option<i64> =
            sqlx::query_scalar("SELECT id FROM files WHERE lower(path) = lower($1)")
                .bind(&request.path)
                .fetch_optional(&mut *conn)
                .await?;
        raced.map(FileId).ok_or_else(|| {
            QueueError::Contention(format!("file `{}` vanished after insert", request.path))
        })
    }

    /// Writes the new size and page count and moves the difference into the
    /// counters of every record the file already has.
    async fn update_file_weight(
        &self,
        conn: &mut PgConnection,
        file_id: FileId,
        request: &EnqueueFile,
    ) -> QueueResult<()> {
        Self::count_query(&self.query_counts, "update:file_attributes");
        let row = sqlx::query(
            r#"
            WITH old AS (
                SELECT id, size_bytes, page_count FROM files WHERE id = $1 FOR UPDATE
            )
            UPDATE files f
            SET size_bytes = COALESCE($2, f.size_bytes),
                page_count = COALESCE($3, f.page_count)
            FROM old
            WHERE f.id = old.id
            RETURNING f.size_bytes - old.size_bytes AS bytes_delta,
                      (f.page_count - old.page_count)::BIGINT AS pages_delta
            "#,
        )
        .bind(file_id.0)
        .bind(request.size_bytes)
        .bind(request.page_count)
        .fetch_one(&mut *conn)
        .await?;
        let bytes_delta: i64 = row.try_get("bytes_delta")?;
        let pages_delta: i64 = row.try_get("pages_delta")?;
        if bytes_delta == 0 && pages_delta == 0 {
            return Ok(());
        }

        Self::count_query(&self.query_counts, "select:records_for_file");
        let rows = sqlx::query("SELECT action_id, status FROM queue_records WHERE file_id = $1")
            .bind(file_id.0)
            .fetch_all(&mut *conn)
            .await?;
        let mut deltas = StatDeltas::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            deltas.reweigh(
                ActionId(row.try_get("action_id")?),
                parse_status(&status)?,
                bytes_delta,
                pages_delta,
            );
        }
        apply_stat_deltas(conn, &deltas).await
    }

    #[obs]
    async fn enqueue_file_once(
        &self,
        request: &EnqueueFile,
        mode: LockMode,
    ) -> QueueResult<EnqueueOutcome> {
        let mut tx = self.pool.begin().await?;
        let file_id = self.file_id_for_path(&mut tx, request, mode).await?;

        if request.size_bytes.is_some() || request.page_count.is_some() {
            self.update_file_weight(&mut tx, file_id, request).await?;
        }
        if let Some(workflow_id) = request.workflow_id {
            Self::count_query(&self.query_counts, "insert:workflow_files");
            sqlx::query(
                "INSERT INTO workflow_files (workflow_id, file_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(workflow_id.0)
            .bind(file_id.0)
            .execute(&mut *tx)
            .await?;
        }

        let context = load_record_context(&mut tx, file_id, request.action_id).await?;
        let current = load_record_for_update(&mut tx, file_id, request.action_id, mode).await?;
        let transition = StatusTransition {
            priority: request.priority,
            force: request.force,
            ..StatusTransition::new(file_id, request.action_id, QueueStatus::Pending)
        };
        let plan = ledger::plan_enqueue(current.as_ref(), &transition)?;
        Self::count_query(&self.query_counts, "upsert:queue_records");
        write_plan(
            &mut tx,
            file_id,
            request.action_id,
            &plan,
            current.as_ref().and_then(|record| record.lease_id),
            &context,
        )
        .await?;
        tx.commit().await?;

        Ok(EnqueueOutcome {
            file_id,
            previous: plan.from,
            status: plan.to,
            queued: plan.to == QueueStatus::Pending,
        })
    }

    #[obs]
    async fn transition_once(
        &self,
        request: &StatusTransition,
        mode: LockMode,
    ) -> QueueResult<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;
        let context = load_record_context(&mut tx, request.file_id, request.action_id).await?;
        let current =
            load_record_for_update(&mut tx, request.file_id, request.action_id, mode).await?;
        let plan = ledger::plan_transition(current.as_ref(), request)?;
        Self::count_query(&self.query_counts, "update:queue_records");
        write_plan(
            &mut tx,
            request.file_id,
            request.action_id,
            &plan,
            current.as_ref().and_then(|record| record.lease_id),
            &context,
        )
        .await?;
        tx.commit().await?;
        Ok(TransitionOutcome {
            previous: plan.from,
            status: plan.to,
            changed: plan.changed,
        })
    }

    /// Existing records move first, then workflow members without a record get
    /// one. Processing records belong to live workers and are left alone.
    #[obs]
    async fn set_status_for_action_once(
        &self,
        change: &BulkStatusChange,
        mode: LockMode,
    ) -> QueueResult<u64> {
        let mut tx = self.pool.begin().await?;
        let action = sqlx::query(
            r#"
            SELECT a.workflow_id, COALESCE(w.track_history, FALSE) AS track_history
            FROM actions a
            LEFT JOIN workflows w ON w.id = a.workflow_id
            WHERE a.id = $1
            "#,
        )
        .bind(change.action_id.0)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| QueueError::NotFound(format!("action {}", change.action_id)))?;
        let workflow_id: Option<i64> = action.try_get("workflow_id")?;
        let track_history: bool = action.try_get("track_history")?;

        let lock_clause = match mode {
            LockMode::Unlocked => "FOR UPDATE NOWAIT",
            LockMode::Locked => "FOR UPDATE",
        };
        let update_sql = format!(
            r#"
            WITH target AS (
                SELECT qr.file_id, qr.status AS old_status, qr.lease_id AS old_lease
                FROM queue_records qr
                WHERE qr.action_id = $1
                  AND qr.status <> $2
                  AND qr.status <> 'processing'
                {lock_clause}
            )
            UPDATE queue_records qr
            SET status = $2,
                lease_id = NULL,
                comment = NULL,
                skipped_by = $3,
                priority = COALESCE($4::SMALLINT, qr.priority),
                sequence = CASE WHEN $2 = 'pending' THEN nextval('queue_sequence') ELSE qr.sequence END,
                updated_at = NOW()
            FROM target
            JOIN files f ON f.id = target.file_id
            WHERE qr.action_id = $1 AND qr.file_id = target.file_id
            RETURNING qr.file_id, target.old_status, target.old_lease, f.size_bytes,
                      f.page_count::BIGINT AS page_count
            "#
        );
        let skipped_by = (change.to == QueueStatus::Skipped)
            .then(|| change.user.clone())
            .flatten();
        let priority = change.priority.map(|priority| priority.as_i16());

        Self::count_query(&self.query_counts, "update:queue_records_bulk");
        let updated = sqlx::query(&update_sql)
            .bind(change.action_id.0)
            .bind(change.to.as_str())
            .bind(skipped_by.as_deref())
            .bind(priority)
            .fetch_all(&mut *tx)
            .await?;

        let inserted = if change.to == QueueStatus::Unattempted {
            Vec::new()
        } else {
            Self::count_query(&self.query_counts, "insert:queue_records_bulk");
            sqlx::query(
                r#"
                WITH inserted AS (
                    INSERT INTO queue_records (file_id, action_id, status, priority, skipped_by)
                    SELECT f.id, $1, $2, COALESCE($4::SMALLINT, 3::SMALLINT), $3
                    FROM files f
                    WHERE NOT f.deleted
                      AND ($5::BIGINT IS NULL OR EXISTS (
                          SELECT 1 FROM workflow_files wf
                          WHERE wf.workflow_id = $5 AND wf.file_id = f.id
                      ))
                      AND NOT EXISTS (
                          SELECT 1 FROM queue_records qr
                          WHERE qr.file_id = f.id AND qr.action_id = $1
                      )
                    ORDER BY f.id
                    ON CONFLICT (file_id, action_id) DO NOTHING
                    RETURNING file_id
                )
                SELECT i.file_id, f.size_bytes, f.page_count::BIGINT AS page_count
                FROM inserted i
                JOIN files f ON f.id = i.file_id
                "#,
            )
            .bind(change.action_id.0)
            .bind(change.to.as_str())
            .bind(skipped_by.as_deref())
            .bind(priority)
            .bind(workflow_id)
            .fetch_all(&mut *tx)
            .await?
        };

        let mut deltas = StatDeltas::default();
        let mut history = Vec::new();
        for row in &updated {
            let file_id = FileId(row.try_get("file_id")?);
            let old_status: String = row.try_get("old_status")?;
            let from = parse_status(&old_status)?;
            deltas.record(
                change.action_id,
                Some(from),
                Some(change.to),
                row.try_get("size_bytes")?,
                row.try_get("page_count")?,
            );
            if track_history {
                let old_lease: Option<uuid::Uuid> = row.try_get("old_lease")?;
                history.push(HistoryEntry {
                    file_id,
                    action_id: change.action_id,
                    from,
                    to: change.to,
                    lease_id: old_lease.map(crate::model::LeaseId),
                    comment: None,
                });
            }
        }
        for row in &inserted {
            let file_id = FileId(row.try_get("file_id")?);
            deltas.record(
                change.action_id,
                None,
                Some(change.to),
                row.try_get("size_bytes")?,
                row.try_get("page_count")?,
            );
            if track_history {
                history.push(HistoryEntry {
                    file_id,
                    action_id: change.action_id,
                    from: QueueStatus::Unattempted,
                    to: change.to,
                    lease_id: None,
                    comment: None,
                });
            }
        }
        apply_stat_deltas(&mut tx, &deltas).await?;
        append_history(&mut tx, history).await?;
        tx.commit().await?;
        Ok((updated.len() + inserted.len()) as u64)
    }
}

#[async_trait]
impl LedgerBackend for PostgresBackend {
    async fn enqueue_file(
        &self,
        request: &EnqueueFile,
        mode: LockMode,
    ) -> QueueResult<EnqueueOutcome> {
        self.enqueue_file_once(request, mode).await
    }

    async fn transition(
        &self,
        request: &StatusTransition,
        mode: LockMode,
    ) -> QueueResult<TransitionOutcome> {
        self.transition_once(request, mode).await
    }

    async fn set_status_for_action(
        &self,
        change: &BulkStatusChange,
        mode: LockMode,
    ) -> QueueResult<u64> {
        self.set_status_for_action_once(change, mode).await
    }

    async fn get_record(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Option<QueueRecord>> {
        Self::count_query(&self.query_counts, "select:queue_record");
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM queue_records qr WHERE qr.file_id = $1 AND qr.action_id = $2"
        );
        let row = sqlx::query(&sql)
            .bind(file_id.0)
            .bind(action_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_file(&self, path: &str) -> QueueResult<Option<FileRecord>> {
        Self::count_query(&self.query_counts, "select:file_by_path");
        let row = sqlx::query(
            "SELECT id, path, size_bytes, page_count, deleted FROM files WHERE lower(path) = lower($1)",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(file_from_row).transpose()
    }

    async fn set_file_deleted(&self, file_id: FileId, deleted: bool) -> QueueResult<()> {
        Self::count_query(&self.query_counts, "update:file_deleted");
        let result = sqlx::query("UPDATE files SET deleted = $2 WHERE id = $1")
            .bind(file_id.0)
            .bind(deleted)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(format!("file {file_id}")));
        }
        Ok(())
    }

    async fn purge_file(&self, file_id: FileId) -> QueueResult<bool> {
        let mut tx = self.pool.begin().await?;
        let file = sqlx::query(
            "SELECT size_bytes, page_count::BIGINT AS page_count FROM files WHERE id = $1 FOR UPDATE",
        )
        .bind(file_id.0)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(file) = file else {
            tx.commit().await?;
            return Ok(false);
        };
        let context = RecordContext {
            size_bytes: file.try_get("size_bytes")?,
            page_count: file.try_get("page_count")?,
            track_history: false,
        };

        let records = sqlx::query(
            "SELECT action_id, status FROM queue_records WHERE file_id = $1 FOR UPDATE",
        )
        .bind(file_id.0)
        .fetch_all(&mut *tx)
        .await?;
        let mut deltas = StatDeltas::default();
        for row in &records {
            let status: String = row.try_get("status")?;
            deltas.record(
                ActionId(row.try_get("action_id")?),
                Some(parse_status(&status)?),
                None,
                context.size_bytes,
                context.page_count,
            );
        }

        // queue records, memberships and history cascade from the file row
        Self::count_query(&self.query_counts, "delete:files");
        sqlx::query("DELETE FROM files WHERE id = $1")
            .bind(file_id.0)
            .execute(&mut *tx)
            .await?;
        apply_stat_deltas(&mut tx, &deltas).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn status_history(
        &self,
        file_id: FileId,
        action_id: ActionId,
    ) -> QueueResult<Vec<StatusChange>> {
        Self::count_query(&self.query_counts, "select:queue_status_history");
        let rows = sqlx::query(
            r#"
            SELECT file_id, action_id, from_status, to_status, lease_id, comment, changed_at
            FROM queue_status_history
            WHERE file_id = $1 AND action_id = $2
            ORDER BY id
            "#,
        )
        .bind(file_id.0)
        .bind(action_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::super::test_helpers::setup_backend;
    use super::*;
    use crate::backends::base::{NewAction, NewWorkflow, RegistryBackend, StatsBackend};
    use crate::model::{Action, Priority, WorkflowType};

    async fn scoped_action(backend: &PostgresBackend, track_history: bool) -> Action {
        let workflow = backend
            .get_or_create_workflow(
                &NewWorkflow {
                    name: "W1".into(),
                    workflow_type: WorkflowType::Extraction,
                    track_history,
                },
                LockMode::Unlocked,
            )
            .await
            .expect("workflow");
        backend
            .get_or_create_action(
                &NewAction {
                    name: "Extract".into(),
                    workflow_id: Some(workflow.id),
                },
                LockMode::Unlocked,
            )
            .await
            .expect("action")
    }

    fn enqueue(path: &str, action: &Action) -> EnqueueFile {
        EnqueueFile {
            path: path.into(),
            size_bytes: Some(2048),
            page_count: Some(3),
            action_id: action.id,
            workflow_id: action.workflow_id,
            priority: Some(Priority::Normal),
            force: false,
        }
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn ledger_transition_checks_expected_status_and_audits() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let action = scoped_action(&backend, true).await;
        let outcome = backend
            .enqueue_file(&enqueue("/docs/a.pdf", &action), LockMode::Unlocked)
            .await
            .expect("enqueue");
        assert_eq!(outcome.previous, QueueStatus::Unattempted);

        let mut complete = StatusTransition::new(outcome.file_id, action.id, QueueStatus::Completed);
        complete.expected_from = Some(QueueStatus::Processing);
        let err = backend
            .transition(&complete, LockMode::Unlocked)
            .await
            .expect_err("pending is not processing");
        assert!(matches!(err, QueueError::StatusMismatch { .. }));

        complete.force = true;
        let done = backend
            .transition(&complete, LockMode::Unlocked)
            .await
            .expect("forced completion");
        assert_eq!(done.previous, QueueStatus::Pending);

        let history = backend
            .status_history(outcome.file_id, action.id)
            .await
            .expect("history");
        let steps: Vec<_> = history.iter().map(|change| (change.from, change.to)).collect();
        assert_eq!(
            steps,
            vec![
                (QueueStatus::Unattempted, QueueStatus::Pending),
                (QueueStatus::Pending, QueueStatus::Completed),
            ]
        );
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn ledger_bulk_status_covers_workflow_members() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let action = scoped_action(&backend, false).await;
        for path in ["/docs/a.pdf", "/docs/b.pdf"] {
            backend
                .enqueue_file(&enqueue(path, &action), LockMode::Unlocked)
                .await
                .expect("enqueue");
        }
        let changed = backend
            .set_status_for_action(
                &BulkStatusChange {
                    action_id: action.id,
                    to: QueueStatus::Skipped,
                    user: Some("reviewer".into()),
                    priority: None,
                },
                LockMode::Unlocked,
            )
            .await
            .expect("bulk skip");
        assert_eq!(changed, 2);

        let stats = backend
            .action_statistics(&[action.id])
            .await
            .expect("stats");
        let skipped = stats
            .iter()
            .find(|row| row.status == QueueStatus::Skipped)
            .expect("skipped counters");
        assert_eq!(skipped.counters.files, 2);
        assert_eq!(skipped.counters.bytes, 4096);
    }

    #[serial(postgres)]
    #[tokio::test]
    async fn ledger_purge_removes_records_and_counters() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let action = scoped_action(&backend, true).await;
        let outcome = backend
            .enqueue_file(&enqueue("/docs/a.pdf", &action), LockMode::Unlocked)
            .await
            .expect("enqueue");
        assert!(backend.purge_file(outcome.file_id).await.expect("purge"));
        assert!(
            backend
                .find_file("/docs/a.pdf")
                .await
                .expect("find")
                .is_none()
        );
        let stats = backend
            .action_statistics(&[action.id])
            .await
            .expect("stats");
        assert!(stats.iter().all(|row| row.counters.files == 0));
    }
}
