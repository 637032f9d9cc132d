//! SQLite connection pool management.

use keel_core::{KeelError, KeelResult};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Location and pool settings of a store instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file. Two stores opened on the same path share their jobs.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Maximum pooled connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a connection waits on a locked database, in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_connections: default_max_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("keel.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_busy_timeout() -> u64 {
    5000
}

impl StoreConfig {
    /// Config for a store at `path` with default pool settings.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Returns the busy timeout as Duration.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Opens the pool and brings the schema up to date.
pub async fn connect(config: &StoreConfig) -> KeelResult<SqlitePool> {
    if config.max_connections == 0 {
        return Err(KeelError::Configuration(
            "store max_connections must be at least 1".to_string(),
        ));
    }

    info!(path = %config.path.display(), "Opening job store...");

    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(config.busy_timeout());

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| {
            warn!(path = %config.path.display(), "Failed to open job store: {}", e);
            KeelError::Storage(format!("Failed to open store: {}", e))
        })?;

    run_migrations(&pool).await?;

    info!(path = %config.path.display(), "Job store ready");
    Ok(pool)
}

/// Runs the embedded schema migrations.
pub async fn run_migrations(pool: &SqlitePool) -> KeelResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
