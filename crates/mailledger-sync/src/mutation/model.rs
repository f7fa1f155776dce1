//! Mutation data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{EntityId, Fields, SyncScope};

/// Field name holding the mailbox an email lives in.
pub const MAILBOX_FIELD: &str = "mailbox_id";

/// Standard keywords that can be set on an email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Keyword {
    /// Message has been read.
    Seen,
    /// Message is flagged/starred.
    Flagged,
    /// Message has been answered.
    Answered,
    /// Message is a draft.
    Draft,
}

impl Keyword {
    /// Field name the keyword is stored under.
    #[must_use]
    pub const fn field(self) -> &'static str {
        match self {
            Self::Seen => "seen",
            Self::Flagged => "flagged",
            Self::Answered => "answered",
            Self::Draft => "draft",
        }
    }
}

/// Field-level target of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target<'a> {
    /// The operation changes these fields.
    Fields(Vec<&'a str>),
    /// The operation affects the whole entity.
    Entity,
}

impl Target<'_> {
    /// Returns true if the target covers the named field.
    #[must_use]
    pub fn covers(&self, field: &str) -> bool {
        match self {
            Self::Fields(fields) => fields.contains(&field),
            Self::Entity => true,
        }
    }
}

/// A local write intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Set or clear a keyword.
    SetKeyword {
        /// Keyword to change.
        keyword: Keyword,
        /// New value.
        value: bool,
    },
    /// Move an email to another mailbox.
    Move {
        /// Destination mailbox id.
        to_mailbox: String,
    },
    /// Delete the entity.
    Delete,
    /// Set an arbitrary field.
    SetField {
        /// Field name.
        field: String,
        /// New value.
        value: Value,
    },
}

impl Operation {
    /// Flag or unflag an email.
    #[must_use]
    pub const fn flag(value: bool) -> Self {
        Self::SetKeyword {
            keyword: Keyword::Flagged,
            value,
        }
    }

    /// Mark an email read or unread.
    #[must_use]
    pub const fn mark_seen(value: bool) -> Self {
        Self::SetKeyword {
            keyword: Keyword::Seen,
            value,
        }
    }

    /// Fields the operation writes.
    #[must_use]
    pub fn target(&self) -> Target<'_> {
        match self {
            Self::SetKeyword { keyword, .. } => Target::Fields(vec![keyword.field()]),
            Self::Move { .. } => Target::Fields(vec![MAILBOX_FIELD]),
            Self::SetField { field, .. } => Target::Fields(vec![field.as_str()]),
            Self::Delete => Target::Entity,
        }
    }

    /// Applies the operation to a field set. `Delete` leaves fields alone;
    /// the cache tombstones the row instead.
    pub fn apply(&self, fields: &mut Fields) {
        match self {
            Self::SetKeyword { keyword, value } => {
                fields.insert(keyword.field().to_string(), Value::Bool(*value));
            }
            Self::Move { to_mailbox } => {
                fields.insert(MAILBOX_FIELD.to_string(), Value::String(to_mailbox.clone()));
            }
            Self::SetField { field, value } => {
                fields.insert(field.clone(), value.clone());
            }
            Self::Delete => {}
        }
    }

    /// Short operation name for logging.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::SetKeyword { .. } => "set-keyword",
            Self::Move { .. } => "move",
            Self::Delete => "delete",
            Self::SetField { .. } => "set-field",
        }
    }
}

/// Identifier of a pending mutation, unique within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub u64);

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Lifecycle of a pending mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationStatus {
    /// Waiting to be sent.
    Queued,
    /// Sent, awaiting the server's answer.
    InFlight,
    /// The server accepted it.
    Confirmed,
    /// The server declined it, or it could not be delivered.
    Rejected {
        /// Why the mutation was rejected.
        reason: String,
    },
}

impl MutationStatus {
    /// Returns true for `Confirmed` and `Rejected`.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected { .. })
    }

    /// Returns true for `Queued` and `InFlight`.
    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        !self.is_terminal()
    }
}

/// A local write intent awaiting server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Mutation id.
    pub id: MutationId,
    /// Scope of the target entity.
    pub scope: SyncScope,
    /// Target entity.
    pub target: EntityId,
    /// What to do.
    pub operation: Operation,
    /// When the mutation was submitted.
    pub submitted_at: DateTime<Utc>,
    /// Current status.
    pub status: MutationStatus,
    /// Send attempts so far.
    pub attempts: u32,
}

impl PendingMutation {
    /// Creates a queued mutation.
    #[must_use]
    pub fn new(id: MutationId, scope: SyncScope, target: EntityId, operation: Operation) -> Self {
        Self {
            id,
            scope,
            target,
            operation,
            submitted_at: Utc::now(),
            status: MutationStatus::Queued,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_targets() {
        assert!(Operation::flag(true).target().covers("flagged"));
        assert!(!Operation::flag(true).target().covers("subject"));
        assert!(
            Operation::Move {
                to_mailbox: "Archive".into()
            }
            .target()
            .covers(MAILBOX_FIELD)
        );
        assert!(Operation::Delete.target().covers("anything"));
    }

    #[test]
    fn test_apply() {
        let mut fields = Fields::new();
        Operation::mark_seen(true).apply(&mut fields);
        Operation::Move {
            to_mailbox: "Archive".into(),
        }
        .apply(&mut fields);
        Operation::SetField {
            field: "label".into(),
            value: json!("work"),
        }
        .apply(&mut fields);

        assert_eq!(fields["seen"], json!(true));
        assert_eq!(fields[MAILBOX_FIELD], json!("Archive"));
        assert_eq!(fields["label"], json!("work"));
    }

    #[test]
    fn test_status_terminality() {
        assert!(MutationStatus::Queued.is_unresolved());
        assert!(MutationStatus::InFlight.is_unresolved());
        assert!(MutationStatus::Confirmed.is_terminal());
        assert!(
            MutationStatus::Rejected {
                reason: "no".into()
            }
            .is_terminal()
        );
    }
}
