//! Scope notifications for the presentation layer.

use std::collections::BTreeSet;

use tokio::sync::broadcast;

use crate::error::ErrorKind;
use crate::types::{EntityId, SyncScope};

/// Scope-level notification for the presentation layer.
///
/// Consumers re-read changed entities from the cache; events never carry
/// entity payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEvent {
    /// Entities of the scope changed.
    Updated {
        /// Scope that changed.
        scope: SyncScope,
        /// Changed ids, including removed ones.
        ids: BTreeSet<EntityId>,
    },
    /// A sync run failed. The last good state and token are intact.
    Failed {
        /// Scope whose run failed.
        scope: SyncScope,
        /// Error kind.
        kind: ErrorKind,
        /// Error message.
        message: String,
    },
    /// The stored token was dropped and a full listing follows.
    FullResyncRequired {
        /// Scope being resynchronized.
        scope: SyncScope,
    },
}

impl ScopeEvent {
    /// A single entity of `scope` changed.
    #[must_use]
    pub fn updated(scope: SyncScope, id: EntityId) -> Self {
        Self::Updated {
            scope,
            ids: BTreeSet::from([id]),
        }
    }
}

/// Broadcast a notification. Having no subscribers is fine.
pub(crate) fn publish(events: &broadcast::Sender<ScopeEvent>, event: ScopeEvent) {
    let _ = events.send(event);
}
