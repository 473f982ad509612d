use async_trait::async_trait;
use sqlx::Row;

use super::PostgresBackend;
use super::rows::parse_status;
use crate::backends::base::{QueueResult, StatsBackend};
use crate::model::{ActionId, ActionStatusCounters, StatusCounters};
use crate::observability::obs;

impl PostgresBackend {
    /// Rebuilds counters for the given actions (all when empty) from the ledger.
    #[obs]
    async fn rebuild_statistics(&self, action_ids: &[ActionId]) -> QueueResult<u64> {
        let ids: Vec<i64> = action_ids.iter().map(|id| id.0).collect();
        let mut tx = self.pool.begin().await?;
        Self::count_query(&self.query_counts, "delete:action_statistics");
        sqlx::query(
            "DELETE FROM action_statistics WHERE cardinality($1::BIGINT[]) = 0 OR action_id = ANY($1)",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        Self::count_query(&self.query_counts, "insert:action_statistics_rebuild");
        let result = sqlx::query(
            r#"
            INSERT INTO action_statistics (action_id, status, file_count, byte_count, page_count)
            SELECT qr.action_id,
                   qr.status,
                   COUNT(*)::BIGINT,
                   COALESCE(SUM(f.size_bytes), 0)::BIGINT,
                   COALESCE(SUM(f.page_count), 0)::BIGINT
            FROM queue_records qr
            JOIN files f ON f.id = qr.file_id
            WHERE cardinality($1::BIGINT[]) = 0 OR qr.action_id = ANY($1)
            GROUP BY qr.action_id, qr.status
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl StatsBackend for PostgresBackend {
    async fn action_statistics(
        &self,
        action_ids: &[ActionId],
    ) -> QueueResult<Vec<ActionStatusCounters>> {
        if action_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = action_ids.iter().map(|id| id.0).collect();
        Self::count_query(&self.query_counts, "select:action_statistics");
        let rows = sqlx::query(
            r#"
            SELECT action_id, status, file_count, byte_count, page_count
            FROM action_statistics
            WHERE action_id = ANY($1)
            ORDER BY action_id, status
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(ActionStatusCounters {
                    action_id: ActionId(row.try_get("action_id")?),
                    status: parse_status(&status)?,
                    counters: StatusCounters {
                        files: row.try_get("file_count")?,
                        bytes: row.try_get("byte_count")?,
                        pages: row.try_get("page_count")?,
                    },
                })
            })
            .collect()
    }

    async fn recalc_statistics(&self, action_ids: &[ActionId]) -> QueueResult<u64> {
        self.rebuild_statistics(action_ids).await
    }
}
