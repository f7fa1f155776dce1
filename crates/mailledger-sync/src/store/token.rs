//! Last-acknowledged state token per scope.

use chrono::Utc;
use sqlx::Row;
use tracing::{debug, warn};

use super::Database;
use crate::Result;
use crate::types::{AccountId, StateToken, SyncScope};

/// Persists the last state token acknowledged for each scope.
///
/// A missing token means the scope was never synchronized and callers
/// must perform a full fetch.
#[derive(Debug, Clone)]
pub struct TokenStore {
    db: Database,
}

impl TokenStore {
    /// Creates a token store over the given database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get the stored token for a scope.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the database query fails.
    pub async fn get(&self, scope: &SyncScope) -> Result<Option<StateToken>> {
        let row = sqlx::query(r"SELECT token FROM state_tokens WHERE scope_key = ?")
            .bind(scope.key())
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.map(|row| StateToken::new(row.get::<String, _>("token"))))
    }

    /// Like [`TokenStore::get`], but a storage failure reads as "never
    /// synchronized" so the caller falls back to a full fetch.
    pub async fn get_or_unknown(&self, scope: &SyncScope) -> Option<StateToken> {
        match self.get(scope).await {
            Ok(token) => token,
            Err(e) => {
                warn!(%scope, ?e, "Failed to read state token, assuming none");
                None
            }
        }
    }

    /// Durably store the token for a scope.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the database query fails.
    pub async fn set(&self, scope: &SyncScope, token: &StateToken) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO state_tokens (scope_key, account_id, token, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(scope_key) DO UPDATE SET
                token = excluded.token,
                updated_at = excluded.updated_at
            ",
        )
        .bind(scope.key())
        .bind(scope.account.0)
        .bind(token.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?;

        debug!(%scope, %token, "State token stored");
        Ok(())
    }

    /// Forget the token for a scope.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the database query fails.
    pub async fn clear(&self, scope: &SyncScope) -> Result<()> {
        sqlx::query(r"DELETE FROM state_tokens WHERE scope_key = ?")
            .bind(scope.key())
            .execute(self.db.pool())
            .await?;

        debug!(%scope, "State token cleared");
        Ok(())
    }

    /// Record that a scope exists. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the database query fails.
    pub async fn register_scope(&self, scope: &SyncScope) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_scopes (scope_key, account_id, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(scope_key) DO NOTHING
            ",
        )
        .bind(scope.key())
        .bind(scope.account.0)
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?;

        Ok(())
    }

    /// List the scopes registered for an account.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the database query fails.
    pub async fn known_scopes(&self, account: AccountId) -> Result<Vec<SyncScope>> {
        let rows = sqlx::query(
            r"SELECT scope_key FROM sync_scopes WHERE account_id = ? ORDER BY scope_key",
        )
        .bind(account.0)
        .fetch_all(self.db.pool())
        .await?;

        let scopes = rows
            .iter()
            .filter_map(|row| {
                let key: String = row.get("scope_key");
                let scope = SyncScope::parse_key(&key);
                if scope.is_none() {
                    warn!(key, "Ignoring unparseable scope key");
                }
                scope
            })
            .collect();

        Ok(scopes)
    }

    /// Remove every scope and token of an account.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the database query fails.
    pub async fn forget_account(&self, account: AccountId) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(r"DELETE FROM state_tokens WHERE account_id = ?")
            .bind(account.0)
            .execute(&mut *tx)
            .await?;

        sqlx::query(r"DELETE FROM sync_scopes WHERE account_id = ?")
            .bind(account.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
