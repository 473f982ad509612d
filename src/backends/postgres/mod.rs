//! Postgres backend for the queue ledger, registry, leases and advisory locks.

mod dequeue;
mod ledger;
mod lease;
mod lock;
mod registry;
mod rows;
mod stats;
#[cfg(test)]
mod test_helpers;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::db;
use crate::observability::obs;

use super::base::{QueueBackend, QueueResult};

/// Queue store backed by a shared Postgres database.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    query_counts: Arc<Mutex<HashMap<String, usize>>>,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            query_counts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Connects eagerly and applies pending migrations.
    #[obs]
    pub async fn connect(dsn: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Builds the pool without touching the database; connections open on first use.
    pub fn connect_lazy(dsn: &str, max_connections: u32) -> QueueResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(dsn)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Delete every queue row, lease and lock. Used to reset test databases.
    #[obs]
    pub async fn clear_all(&self) -> QueueResult<()> {
        Self::count_query(&self.query_counts, "truncate:queue_tables");
        sqlx::query(
            r#"
            TRUNCATE queue_status_history,
                     action_statistics,
                     queue_records,
                     workflow_files,
                     actions,
                     workflows,
                     files,
                     worker_leases,
                     advisory_locks
            RESTART IDENTITY CASCADE
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn query_counts(&self) -> HashMap<String, usize> {
        self.query_counts
            .lock()
            .expect("query counts poisoned")
            .clone()
    }

    pub(super) fn count_query(counts: &Arc<Mutex<HashMap<String, usize>>>, label: &str) {
        let mut guard = counts.lock().expect("query counts poisoned");
        *guard.entry(label.to_string()).or_insert(0) += 1;
    }
}

#[async_trait]
impl QueueBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
