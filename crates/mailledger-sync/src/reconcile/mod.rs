//! Applies server change sets to the local cache.
//!
//! A change set is applied in one critical section per scope: the stored
//! token is checked, destroyed entities are removed, created and updated
//! entities are merged with any pending local intents, and the new token
//! is committed in the same transaction as the entity writes. A crash at
//! any point leaves either the old state with the old token or the new
//! state with the new token.

mod merge;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

pub use merge::merge_fields;

use crate::locks::ScopeLocks;
use crate::mutation::{MutationId, MutationQueue};
use crate::store::{CommitBatch, LocalCache, TokenStore, TokenUpdate};
use crate::types::{CachedEntity, ChangeSet, EntityId, StateToken};
use crate::{Error, Result};

/// What happened to a change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The change set was committed.
    Applied {
        /// Ids whose cached row changed, including removed ones.
        changed: BTreeSet<EntityId>,
        /// Pending mutations rejected because their target was destroyed.
        rejected: Vec<MutationId>,
    },
    /// The change set does not start at the stored token; nothing was
    /// written.
    Stale {
        /// Token the scope is actually at.
        stored: Option<StateToken>,
    },
    /// The server could not express the delta. The stored token was
    /// cleared and the scope needs a full listing.
    FullResyncRequired,
}

impl ReconcileOutcome {
    /// Ids whose cached row changed.
    #[must_use]
    pub fn changed(&self) -> Option<&BTreeSet<EntityId>> {
        match self {
            Self::Applied { changed, .. } => Some(changed),
            Self::Stale { .. } | Self::FullResyncRequired => None,
        }
    }
}

/// Merges change sets into the cache under the per-scope lock shared with
/// the mutation queue.
#[derive(Debug, Clone)]
pub struct Reconciler {
    cache: LocalCache,
    tokens: TokenStore,
    queue: Arc<MutationQueue>,
    locks: Arc<ScopeLocks>,
}

impl Reconciler {
    /// Creates a reconciler.
    ///
    /// `locks` must be the table `queue` was created with.
    #[must_use]
    pub const fn new(
        cache: LocalCache,
        tokens: TokenStore,
        queue: Arc<MutationQueue>,
        locks: Arc<ScopeLocks>,
    ) -> Self {
        Self {
            cache,
            tokens,
            queue,
            locks,
        }
    }

    /// Apply a change set.
    ///
    /// Applying the same change set twice is a no-op the second time: the
    /// stored token has moved past its `from_token`, so it reports
    /// [`ReconcileOutcome::Stale`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if a created or updated id has no record,
    /// or `Error::Persistence` if the commit fails. In both cases neither
    /// the cache nor the token changed.
    pub async fn reconcile(&self, change_set: &ChangeSet) -> Result<ReconcileOutcome> {
        self.apply(change_set, change_set.from_token.as_ref()).await
    }

    /// Apply a full listing over a scope that is still at `replaces`.
    ///
    /// Used for an explicit resync: the old token stays in place until the
    /// listing commits, and the commit swaps it for the listing's token.
    /// If the stored token is no longer `replaces`, nothing is written and
    /// the outcome is [`ReconcileOutcome::Stale`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` if `change_set` is not a full listing,
    /// otherwise the same errors as [`Reconciler::reconcile`].
    pub async fn replace_with_listing(
        &self,
        change_set: &ChangeSet,
        replaces: Option<&StateToken>,
    ) -> Result<ReconcileOutcome> {
        if !change_set.is_full_listing() {
            return Err(Error::Protocol(format!(
                "resync of {} expects a full listing",
                change_set.scope
            )));
        }
        self.apply(change_set, replaces).await
    }

    async fn apply(
        &self,
        change_set: &ChangeSet,
        expected: Option<&StateToken>,
    ) -> Result<ReconcileOutcome> {
        let scope = &change_set.scope;
        let _guard = self.locks.lock(scope).await;

        let stored = self.tokens.get(scope).await?;
        if stored.as_ref() != expected {
            debug!(
                %scope,
                stored = stored.as_ref().map(StateToken::as_str),
                expected = expected.map(StateToken::as_str),
                "Discarding stale change set"
            );
            return Ok(ReconcileOutcome::Stale { stored });
        }

        if change_set.truncated {
            warn!(%scope, "Server truncated the delta, full resync required");
            self.tokens.clear(scope).await?;
            return Ok(ReconcileOutcome::FullResyncRequired);
        }

        let pending = self.queue.unresolved_for(scope);
        let cached_ids: HashSet<EntityId> = self.cache.ids(scope).await?.into_iter().collect();

        let mut destroyed = change_set.destroyed.clone();
        if change_set.is_full_listing() {
            // Anything the listing omits is gone, pending intents included
            for id in &cached_ids {
                if !change_set.created.contains(id) && !change_set.updated.contains(id) {
                    destroyed.insert(id.clone());
                }
            }
        }

        let mut batch = CommitBatch::new(scope.clone());
        let mut changed = BTreeSet::new();

        for id in &destroyed {
            if cached_ids.contains(id) {
                batch.removals.push(id.clone());
                changed.insert(id.clone());
            }
        }

        for id in change_set.created.union(&change_set.updated) {
            if destroyed.contains(id) {
                continue;
            }
            let Some(record) = change_set.records.get(id) else {
                return Err(Error::Protocol(format!("no record for changed entity {id}")));
            };

            let row = match self.cache.get(scope, id).await? {
                Some(mut cached) => {
                    let ops = pending.get(id).map_or(&[][..], Vec::as_slice);
                    let merged = merge_fields(&cached.entity.fields, &record.fields, ops);
                    let unchanged = merged == cached.entity.fields
                        && cached.server.as_ref() == Some(&record.fields)
                        && cached.entity.revision == record.revision;
                    if unchanged {
                        continue;
                    }
                    cached.entity.fields = merged;
                    cached.entity.revision.clone_from(&record.revision);
                    cached.entity.kind = record.kind;
                    cached.server = Some(record.fields.clone());
                    cached
                }
                None => CachedEntity::from_server(record.clone()),
            };
            batch.upserts.push(row);
            changed.insert(id.clone());
        }

        if stored.as_ref() != Some(&change_set.to_token) {
            batch.token = TokenUpdate::Set(change_set.to_token.clone());
        }

        if !batch.is_empty() {
            self.cache.commit(&batch).await?;
        }

        let rejected = self.queue.reject_for_destroyed(scope, &destroyed);

        info!(
            %scope,
            token = %change_set.to_token,
            upserted = batch.upserts.len(),
            removed = batch.removals.len(),
            rejected = rejected.len(),
            "Change set applied"
        );

        Ok(ReconcileOutcome::Applied { changed, rejected })
    }
}
