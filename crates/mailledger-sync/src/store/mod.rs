//! Durable storage for state tokens and entity snapshots.
//!
//! Both stores share one `SQLite` database so that entity writes and the
//! token advance of a reconciliation run can commit in a single
//! transaction.

mod cache;
mod token;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub use cache::{CommitBatch, LocalCache, TokenUpdate};
pub use token::TokenStore;

use crate::{Error, Result};

/// Shared handle to the sync database.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open the database at the given path.
    ///
    /// Creates the database and tables if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn new(database_path: &str) -> Result<Self> {
        let url = format!("sqlite:{database_path}?mode=rwc");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// Create an in-memory database for testing.
    ///
    /// The single connection is never recycled, otherwise its contents
    /// would be lost.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        // Scopes seen so far, kept across restarts until account removal
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS sync_scopes (
                scope_key TEXT PRIMARY KEY,
                account_id INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS state_tokens (
                scope_key TEXT PRIMARY KEY,
                account_id INTEGER NOT NULL,
                token TEXT NOT NULL CHECK (length(token) > 0),
                updated_at TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS entities (
                scope_key TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                account_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                revision TEXT,
                fields_json TEXT NOT NULL,
                server_json TEXT,
                tombstoned INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope_key, entity_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_entities_account
            ON entities(account_id)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Persistence(format!("invalid timestamp {value:?}: {e}")))
}
