use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use super::PostgresBackend;
use crate::backends::base::{LockAttempt, LockBackend, QueueResult};

#[async_trait]
impl LockBackend for PostgresBackend {
    /// One statement: insert the row, refresh it if we already own it, or take it
    /// over once it is older than `expiry`. The `prior` CTE sees the row as it was
    /// before the upsert, which tells a steal apart from a fresh acquisition.
    async fn try_acquire_lock(
        &self,
        name: &str,
        owner: Uuid,
        expiry: Duration,
    ) -> QueueResult<LockAttempt> {
        Self::count_query(&self.query_counts, "upsert:advisory_locks");
        let row = sqlx::query(
            r#"
            WITH prior AS (
                SELECT owner FROM advisory_locks WHERE name = $1
            ),
            upserted AS (
                INSERT INTO advisory_locks (name, owner, acquired_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (name) DO UPDATE
                SET owner = EXCLUDED.owner,
                    acquired_at = EXCLUDED.acquired_at
                WHERE advisory_locks.owner = EXCLUDED.owner
                   OR advisory_locks.acquired_at <= NOW() - make_interval(secs => $3)
                RETURNING owner
            )
            SELECT (SELECT owner FROM upserted) AS granted_to,
                   (SELECT owner FROM prior) AS prior_owner
            "#,
        )
        .bind(name)
        .bind(owner)
        .bind(expiry.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;

        let granted_to: Option<Uuid> = row.try_get("granted_to")?;
        let prior_owner: Option<Uuid> = row.try_get("prior_owner")?;
        Ok(match (granted_to, prior_owner) {
            (Some(_), Some(previous_owner)) if previous_owner != owner => {
                LockAttempt::Stolen { previous_owner }
            }
            (Some(_), _) => LockAttempt::Acquired,
            (None, prior_owner) => LockAttempt::Busy { owner: prior_owner },
        })
    }

    async fn release_lock(&self, name: &str, owner: Uuid) -> QueueResult<bool> {
        Self::count_query(&self.query_counts, "delete:advisory_locks");
        let result = sqlx::query("DELETE FROM advisory_locks WHERE name = $1 AND owner = $2")
            .bind(name)
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::super::test_helpers::setup_backend;
    use super::*;

    #[serial(postgres)]
    #[tokio::test]
    async fn lock_acquire_release_and_steal() {
        let Some(backend) = setup_backend().await else {
            return;
        };
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        let expiry = Duration::from_secs(60);

        let attempt = backend
            .try_acquire_lock("docqueue.main", first, expiry)
            .await
            .expect("acquire");
        assert_eq!(attempt, LockAttempt::Acquired);

        let attempt = backend
            .try_acquire_lock("docqueue.main", second, expiry)
            .await
            .expect("contend");
        assert_eq!(attempt, LockAttempt::Busy { owner: Some(first) });

        sqlx::query(
            "UPDATE advisory_locks SET acquired_at = NOW() - INTERVAL '10 minutes' WHERE name = $1",
        )
        .bind("docqueue.main")
        .execute(backend.pool())
        .await
        .expect("age lock");

        let attempt = backend
            .try_acquire_lock("docqueue.main", second, expiry)
            .await
            .expect("steal");
        assert_eq!(
            attempt,
            LockAttempt::Stolen {
                previous_owner: first
            }
        );
        assert!(!backend.release_lock("docqueue.main", first).await.expect("stale release"));
        assert!(backend.release_lock("docqueue.main", second).await.expect("release"));
    }
}
