//! Schema migrations embedded from `migrations/`.

use sqlx::PgPool;

use crate::backends::QueueResult;

/// Run the embedded SQLx migrations.
pub async fn run_migrations(pool: &PgPool) -> QueueResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
