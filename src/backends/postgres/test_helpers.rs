use super::PostgresBackend;

pub(super) const TEST_DATABASE_URL_ENV: &str = "DOCQUEUE_TEST_DATABASE_URL";

/// Connects, migrates and truncates the test database, or returns `None` when
/// no test database is configured.
pub(super) async fn setup_backend() -> Option<PostgresBackend> {
    let Ok(dsn) = std::env::var(TEST_DATABASE_URL_ENV) else {
        eprintln!("skipping test: {TEST_DATABASE_URL_ENV} not set");
        return None;
    };
    let backend = PostgresBackend::connect(&dsn, 8)
        .await
        .unwrap_or_else(|err| panic!("connect test database: {err}"));
    backend
        .clear_all()
        .await
        .unwrap_or_else(|err| panic!("reset test database: {err}"));
    Some(backend)
}
