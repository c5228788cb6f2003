//! SQLite connection pool setup.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid database URL '{url}': {source}")]
    InvalidUrl { url: String, #[source] source: sqlx::Error },
    #[error("Failed to connect: {0}")]
    ConnectFailed(#[source] sqlx::Error),
}

/// Pool tuning knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Create a pool with WAL journaling. Creates the database file if missing.
pub async fn create_pool(database_url: &str, config: Option<PoolConfig>) -> Result<SqlitePool, ConnectionError> {
    let config = config.unwrap_or_default();

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| ConnectionError::InvalidUrl { url: database_url.to_string(), source: e })?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await
        .map_err(ConnectionError::ConnectFailed)
}

/// In-memory pool for tests. A single connection keeps the database alive
/// for the pool's lifetime.
pub async fn create_test_pool() -> Result<SqlitePool, ConnectionError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .map_err(|e| ConnectionError::InvalidUrl { url: "sqlite::memory:".to_string(), source: e })?
        .foreign_keys(true);

    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(ConnectionError::ConnectFailed)
}

/// Cheap liveness probe.
pub async fn verify_connection(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
