//! Normalized server deltas.

use std::collections::{BTreeMap, BTreeSet};

use super::{Entity, EntityId, StateToken, SyncScope};

/// Created/updated/destroyed delta between two state tokens.
///
/// Produced by the delta fetcher and consumed exactly once by the
/// reconciler. A change set with no `from_token` is a full listing:
/// `created` holds every id the server currently has.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    /// Scope the delta belongs to.
    pub scope: SyncScope,
    /// Token the delta starts from (`None` for a full listing).
    pub from_token: Option<StateToken>,
    /// Token the delta brings the scope to.
    pub to_token: StateToken,
    /// Ids created since `from_token`.
    pub created: BTreeSet<EntityId>,
    /// Ids updated since `from_token`.
    pub updated: BTreeSet<EntityId>,
    /// Ids destroyed since `from_token`.
    pub destroyed: BTreeSet<EntityId>,
    /// The server could not express the full delta.
    pub truncated: bool,
    /// Server snapshots for created and updated ids.
    pub records: BTreeMap<EntityId, Entity>,
}

impl ChangeSet {
    /// Creates an empty change set.
    #[must_use]
    pub fn new(scope: SyncScope, from_token: Option<StateToken>, to_token: StateToken) -> Self {
        Self {
            scope,
            from_token,
            to_token,
            created: BTreeSet::new(),
            updated: BTreeSet::new(),
            destroyed: BTreeSet::new(),
            truncated: false,
            records: BTreeMap::new(),
        }
    }

    /// Returns true if this change set is a full listing.
    #[must_use]
    pub const fn is_full_listing(&self) -> bool {
        self.from_token.is_none()
    }

    /// Returns true if the change set carries no changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.destroyed.is_empty()
    }

    /// Number of ids touched.
    #[must_use]
    pub fn change_count(&self) -> usize {
        self.created.len() + self.updated.len() + self.destroyed.len()
    }

    /// Adds a created record.
    pub fn push_created(&mut self, entity: Entity) {
        self.created.insert(entity.id.clone());
        self.records.insert(entity.id.clone(), entity);
    }

    /// Adds an updated record.
    pub fn push_updated(&mut self, entity: Entity) {
        self.updated.insert(entity.id.clone());
        self.records.insert(entity.id.clone(), entity);
    }

    /// Folds one page of changes into the accumulated set.
    ///
    /// Later pages win: an id created and then destroyed within the same
    /// fetch disappears entirely, an id updated and then destroyed is
    /// destroyed, and an id created and then updated stays created.
    pub fn absorb_page(
        &mut self,
        created: impl IntoIterator<Item = EntityId>,
        updated: impl IntoIterator<Item = EntityId>,
        destroyed: impl IntoIterator<Item = EntityId>,
    ) {
        for id in created {
            self.destroyed.remove(&id);
            self.updated.remove(&id);
            self.created.insert(id);
        }
        for id in updated {
            if !self.created.contains(&id) {
                self.destroyed.remove(&id);
                self.updated.insert(id);
            }
        }
        for id in destroyed {
            self.records.remove(&id);
            self.updated.remove(&id);
            if !self.created.remove(&id) {
                self.destroyed.insert(id);
            }
        }
    }

    /// Ids whose server snapshot is needed (created and updated).
    #[must_use]
    pub fn ids_to_fetch(&self) -> Vec<EntityId> {
        self.created.iter().chain(self.updated.iter()).cloned().collect()
    }
}
