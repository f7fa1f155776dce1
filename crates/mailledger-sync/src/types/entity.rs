//! Entity snapshots held by the local cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field set of an entity, keyed by field name.
///
/// The engine does not interpret field values; it only needs to tell
/// fields apart so server changes and local intents can be merged.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Server-assigned entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    /// Create a new entity ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the raw id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Kind of entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    /// A mailbox (folder).
    Mailbox,
    /// Email metadata.
    Email,
}

impl EntityKind {
    /// Storage name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mailbox => "mailbox",
            Self::Email => "email",
        }
    }

    /// Parses a storage name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mailbox" => Some(Self::Mailbox),
            "email" => Some(Self::Email),
            _ => None,
        }
    }
}

/// A mailbox or email snapshot as reported by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Server-assigned id.
    pub id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Server revision marker, if the server provides one.
    pub revision: Option<String>,
    /// Field values.
    pub fields: Fields,
}

impl Entity {
    /// Creates an entity with no fields.
    #[must_use]
    pub fn new(id: impl Into<EntityId>, kind: EntityKind) -> Self {
        Self {
            id: id.into(),
            kind,
            revision: None,
            fields: Fields::new(),
        }
    }

    /// Sets a field value.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Sets the revision marker.
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A cache row: the local view of an entity plus its last server-confirmed
/// snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    /// Local view (server state with unresolved local intents applied).
    pub entity: Entity,
    /// Last snapshot confirmed by the server. Used for rollback.
    pub server: Option<Fields>,
    /// Set while a local delete awaits confirmation.
    pub tombstoned: bool,
    /// Row version, bumped on every write.
    pub version: i64,
    /// Time of the last write.
    pub updated_at: DateTime<Utc>,
}

impl CachedEntity {
    /// Wraps a server snapshot; local view and server snapshot start equal.
    #[must_use]
    pub fn from_server(entity: Entity) -> Self {
        let server = Some(entity.fields.clone());
        Self {
            entity,
            server,
            tombstoned: false,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Entity id.
    #[must_use]
    pub const fn id(&self) -> &EntityId {
        &self.entity.id
    }
}
