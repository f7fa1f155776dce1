//! Entity snapshot storage.

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use super::{Database, parse_timestamp};
use crate::types::{AccountId, CachedEntity, Entity, EntityId, EntityKind, Fields, StateToken, SyncScope};
use crate::{Error, Result};

/// What a commit does with the scope's state token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenUpdate {
    /// Leave the token untouched.
    Keep,
    /// Advance the token.
    Set(StateToken),
    /// Forget the token.
    Clear,
}

/// A set of entity writes applied together with a token update.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    /// Scope all writes belong to.
    pub scope: SyncScope,
    /// Rows to insert or replace.
    pub upserts: Vec<CachedEntity>,
    /// Ids to delete.
    pub removals: Vec<EntityId>,
    /// Token change committed with the writes.
    pub token: TokenUpdate,
}

impl CommitBatch {
    /// Creates an empty batch for a scope.
    #[must_use]
    pub const fn new(scope: SyncScope) -> Self {
        Self {
            scope,
            upserts: Vec::new(),
            removals: Vec::new(),
            token: TokenUpdate::Keep,
        }
    }

    /// Returns true if the batch writes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty() && self.token == TokenUpdate::Keep
    }
}

/// Durable key-value store of entity snapshots.
#[derive(Debug, Clone)]
pub struct LocalCache {
    db: Database,
}

impl LocalCache {
    /// Creates a cache over the given database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get one entity, including tombstoned rows.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the query fails or the row is corrupt.
    pub async fn get(&self, scope: &SyncScope, id: &EntityId) -> Result<Option<CachedEntity>> {
        let row = sqlx::query(
            r"
            SELECT entity_id, kind, revision, fields_json, server_json, tombstoned,
                   version, updated_at
            FROM entities
            WHERE scope_key = ? AND entity_id = ?
            ",
        )
        .bind(scope.key())
        .bind(id.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(row_to_entity).transpose()
    }

    /// List the visible entities of a scope (tombstoned rows are hidden).
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the query fails or a row is corrupt.
    pub async fn list(&self, scope: &SyncScope) -> Result<Vec<CachedEntity>> {
        let rows = sqlx::query(
            r"
            SELECT entity_id, kind, revision, fields_json, server_json, tombstoned,
                   version, updated_at
            FROM entities
            WHERE scope_key = ? AND tombstoned = 0
            ORDER BY entity_id
            ",
        )
        .bind(scope.key())
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_to_entity).collect()
    }

    /// All ids stored for a scope, tombstoned rows included.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the query fails.
    pub async fn ids(&self, scope: &SyncScope) -> Result<Vec<EntityId>> {
        let rows = sqlx::query(r"SELECT entity_id FROM entities WHERE scope_key = ?")
            .bind(scope.key())
            .fetch_all(self.db.pool())
            .await?;

        Ok(rows
            .iter()
            .map(|row| EntityId(row.get::<String, _>("entity_id")))
            .collect())
    }

    /// Write one row outside a reconciliation (optimistic local writes).
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the write fails.
    pub async fn put_local(&self, scope: &SyncScope, entity: &CachedEntity) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        upsert(&mut tx, scope, entity).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete one row.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the write fails.
    pub async fn remove(&self, scope: &SyncScope, id: &EntityId) -> Result<()> {
        sqlx::query(r"DELETE FROM entities WHERE scope_key = ? AND entity_id = ?")
            .bind(scope.key())
            .bind(id.as_str())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Apply a batch atomically: every entity write and the token update
    /// commit together or not at all.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if any write fails; nothing is committed.
    pub async fn commit(&self, batch: &CommitBatch) -> Result<()> {
        let scope = &batch.scope;
        let mut tx = self.db.pool().begin().await?;

        for entity in &batch.upserts {
            upsert(&mut tx, scope, entity).await?;
        }

        for id in &batch.removals {
            sqlx::query(r"DELETE FROM entities WHERE scope_key = ? AND entity_id = ?")
                .bind(scope.key())
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        match &batch.token {
            TokenUpdate::Keep => {}
            TokenUpdate::Set(token) => {
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
                .execute(&mut *tx)
                .await?;
            }
            TokenUpdate::Clear => {
                sqlx::query(r"DELETE FROM state_tokens WHERE scope_key = ?")
                    .bind(scope.key())
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Drop every cached entity of an account.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the write fails.
    pub async fn clear_account(&self, account: AccountId) -> Result<()> {
        sqlx::query(r"DELETE FROM entities WHERE account_id = ?")
            .bind(account.0)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

async fn upsert(
    tx: &mut Transaction<'_, Sqlite>,
    scope: &SyncScope,
    entity: &CachedEntity,
) -> Result<()> {
    let fields_json = serde_json::to_string(&entity.entity.fields)?;
    let server_json = entity
        .server
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r"
        INSERT INTO entities
            (scope_key, entity_id, account_id, kind, revision, fields_json, server_json,
             tombstoned, version, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?)
        ON CONFLICT(scope_key, entity_id) DO UPDATE SET
            kind = excluded.kind,
            revision = excluded.revision,
            fields_json = excluded.fields_json,
            server_json = excluded.server_json,
            tombstoned = excluded.tombstoned,
            version = entities.version + 1,
            updated_at = excluded.updated_at
        ",
    )
    .bind(scope.key())
    .bind(entity.entity.id.as_str())
    .bind(scope.account.0)
    .bind(entity.entity.kind.as_str())
    .bind(&entity.entity.revision)
    .bind(fields_json)
    .bind(server_json)
    .bind(entity.tombstoned)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_entity(row: &SqliteRow) -> Result<CachedEntity> {
    let kind_str: String = row.get("kind");
    let kind = EntityKind::parse(&kind_str)
        .ok_or_else(|| Error::Persistence(format!("unknown entity kind {kind_str:?}")))?;

    let fields: Fields = serde_json::from_str(&row.get::<String, _>("fields_json"))?;
    let server = row
        .get::<Option<String>, _>("server_json")
        .map(|json| serde_json::from_str::<Fields>(&json))
        .transpose()?;

    Ok(CachedEntity {
        entity: Entity {
            id: EntityId(row.get("entity_id")),
            kind,
            revision: row.get("revision"),
            fields,
        },
        server,
        tombstoned: row.get::<bool, _>("tombstoned"),
        version: row.get("version"),
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
