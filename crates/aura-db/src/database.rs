//! Database connection and table management.
//!
//! Opens the SQLite file in WAL mode so external readers can query while the
//! processor writes.

use crate::error::Result;
use crate::schema;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Busy timeout applied to every pooled connection.
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Main database handle.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    path: PathBuf,
}

/// Row counts per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    pub papers: u64,
    pub terms: u64,
    pub links: u64,
    pub runs: u64,
}

impl Database {
    /// Open or create a database file at the specified path.
    pub async fn open(path: impl AsRef<Path>, max_connections: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "Opened database");
        Ok(Self { pool, path })
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create all tables and indices if they don't exist.
    pub async fn initialize(&self) -> Result<()> {
        for statement in schema::SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema initialized");
        Ok(())
    }

    /// Active journal mode as reported by SQLite (`wal` once opened).
    pub async fn journal_mode(&self) -> Result<String> {
        let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        Ok(mode.to_lowercase())
    }

    /// Get database statistics.
    pub async fn stats(&self) -> Result<DatabaseStats> {
        Ok(DatabaseStats {
            papers: self.count(schema::TABLE_PAPERS).await?,
            terms: self.count(schema::TABLE_TERMS).await?,
            links: self.count(schema::TABLE_TERM_PAPER_LINKS).await?,
            runs: self.count(schema::TABLE_PIPELINE_RUNS).await?,
        })
    }

    async fn count(&self, table: &str) -> Result<u64> {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }

    /// Close the pool, checkpointing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
