//! Per-account sync engine wiring the stores, fetcher, reconciler,
//! mutation queue and push dispatcher together.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::events::{self, ScopeEvent};
use crate::fetch::DeltaFetcher;
use crate::locks::ScopeLocks;
use crate::mutation::{MutationHandle, MutationId, MutationQueue, Operation};
use crate::push::{PushDispatcher, ScopeSyncer, SyncMode};
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::store::{Database, LocalCache, TokenStore};
use crate::transport::{PushEvent, PushSignal, Transport};
use crate::types::{AccountId, Entity, EntityId, StateToken, SyncScope};
use crate::{Error, Result};

/// Stale change sets tolerated in one run before giving up.
const MAX_STALE_REFETCHES: usize = 1;

/// Capacity of the push signal channel.
const PUSH_CHANNEL_CAPACITY: usize = 64;

/// Result of one successful sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    /// Scope that was synchronized.
    pub scope: SyncScope,
    /// Whether the run ended with a full listing.
    pub mode: SyncMode,
    /// Token the scope is now at.
    pub token: StateToken,
    /// Ids whose cached row changed.
    pub changed: BTreeSet<EntityId>,
    /// Mutations rejected because the server destroyed their target.
    pub rejected: Vec<MutationId>,
}

/// Incremental synchronization engine for one account.
pub struct SyncEngine {
    account: AccountId,
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    tokens: TokenStore,
    cache: LocalCache,
    fetcher: DeltaFetcher,
    queue: Arc<MutationQueue>,
    reconciler: Reconciler,
    /// One sync run per scope at a time.
    runs: ScopeLocks,
    events: broadcast::Sender<ScopeEvent>,
    push_tx: mpsc::Sender<PushSignal>,
    push_rx: Mutex<Option<mpsc::Receiver<PushSignal>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("account", &self.account)
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Build an engine over an opened database and a transport.
    ///
    /// Background work does not start until [`SyncEngine::start`].
    #[must_use]
    pub fn open(
        account: AccountId,
        config: SyncConfig,
        database: Database,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let tokens = TokenStore::new(database.clone());
        let cache = LocalCache::new(database);
        let fetcher =
            DeltaFetcher::new(Arc::clone(&transport)).with_timeout(config.request_timeout);

        let (push_tx, push_rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(config.notification_capacity.max(1));
        let locks = Arc::new(ScopeLocks::new());
        let queue = Arc::new(
            MutationQueue::new(cache.clone(), Arc::clone(&locks))
                .with_refetch(push_tx.clone())
                .with_events(events.clone())
                .with_request_timeout(config.request_timeout),
        );
        let reconciler = Reconciler::new(cache.clone(), tokens.clone(), Arc::clone(&queue), locks);

        info!(%account, "Sync engine opened");

        Self {
            account,
            config,
            transport,
            tokens,
            cache,
            fetcher,
            queue,
            reconciler,
            runs: ScopeLocks::new(),
            events,
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Account this engine synchronizes.
    #[must_use]
    pub const fn account(&self) -> AccountId {
        self.account
    }

    /// Spawn the mutation sender and the push dispatcher.
    ///
    /// Calling this more than once has no further effect.
    pub fn start(self: &Arc<Self>) {
        let Some(push_rx) = self
            .push_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            warn!(account = %self.account, "Sync engine already started");
            return;
        };

        let sender = tokio::spawn(Arc::clone(&self.queue).run_sender(
            Arc::clone(&self.transport),
            self.config.retry.clone(),
            self.config.send_concurrency,
            self.cancel.child_token(),
        ));
        let dispatcher = tokio::spawn(
            PushDispatcher::new(Arc::clone(self), self.config.coalesce_window)
                .run(push_rx, self.cancel.child_token()),
        );

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([sender, dispatcher]);
        info!(account = %self.account, "Sync engine started");
    }

    /// Cancel background work and in-flight runs, then wait for the
    /// background tasks to finish.
    ///
    /// Pending mutations stay queued; their handles resolve with
    /// `Error::Cancelled`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(?e, "Background task ended abnormally");
            }
        }
        self.queue.release_waiters();
        info!(account = %self.account, "Sync engine stopped");
    }

    /// Bring a scope up to date with the server.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run. The cache and token are left
    /// at their last good state.
    pub async fn trigger_sync(&self, scope: &SyncScope) -> Result<SyncReport> {
        self.sync(scope, SyncMode::Incremental).await
    }

    /// Fetch a full listing and replace the scope's contents with it.
    ///
    /// The stored token is only replaced once the listing is committed.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the run. The stored token is kept.
    pub async fn full_resync(&self, scope: &SyncScope) -> Result<SyncReport> {
        self.sync(scope, SyncMode::Full).await
    }

    async fn sync(&self, scope: &SyncScope, mode: SyncMode) -> Result<SyncReport> {
        let _run = self.runs.lock(scope).await;
        let result = self.run_locked(scope, mode).await;

        match &result {
            Ok(report) if !report.changed.is_empty() => self.notify(ScopeEvent::Updated {
                scope: scope.clone(),
                ids: report.changed.clone(),
            }),
            Ok(_) | Err(Error::Cancelled) => {}
            Err(e) => {
                warn!(%scope, error = %e, "Sync run failed");
                self.notify(ScopeEvent::Failed {
                    scope: scope.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                });
            }
        }

        result
    }

    async fn run_locked(&self, scope: &SyncScope, mut mode: SyncMode) -> Result<SyncReport> {
        self.tokens.register_scope(scope).await?;

        let cancel = self.cancel.child_token();
        let mut stale_refetches = 0;

        loop {
            let stored = self.tokens.get_or_unknown(scope).await;
            let since = match mode {
                SyncMode::Incremental => stored.clone(),
                SyncMode::Full => None,
            };
            debug!(%scope, ?mode, since = since.as_ref().map(StateToken::as_str), "Sync run");

            let fetched = self
                .fetcher
                .fetch_with_retry(
                    scope,
                    since.as_ref(),
                    self.config.effective_page_limit(),
                    &self.config.retry,
                    &cancel,
                )
                .await;

            let change_set = match fetched {
                Ok(change_set) => change_set,
                Err(Error::TokenInvalid(reason)) if since.is_some() => {
                    warn!(%scope, reason, "Server rejected state token");
                    self.tokens.clear(scope).await?;
                    self.notify(ScopeEvent::FullResyncRequired {
                        scope: scope.clone(),
                    });
                    mode = SyncMode::Full;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let outcome = match mode {
                SyncMode::Incremental => self.reconciler.reconcile(&change_set).await?,
                SyncMode::Full => {
                    self.reconciler
                        .replace_with_listing(&change_set, stored.as_ref())
                        .await?
                }
            };
            match outcome {
                ReconcileOutcome::Applied { changed, rejected } => {
                    return Ok(SyncReport {
                        scope: scope.clone(),
                        mode,
                        token: change_set.to_token,
                        changed,
                        rejected,
                    });
                }
                ReconcileOutcome::Stale { stored } => {
                    if stale_refetches >= MAX_STALE_REFETCHES {
                        return Err(Error::Transient(format!(
                            "state token for {scope} moved during sync"
                        )));
                    }
                    debug!(%scope, ?stored, "Change set was stale, refetching");
                    stale_refetches += 1;
                }
                ReconcileOutcome::FullResyncRequired => {
                    self.notify(ScopeEvent::FullResyncRequired {
                        scope: scope.clone(),
                    });
                    mode = SyncMode::Full;
                }
            }
        }
    }

    /// Apply a local intent optimistically and queue it for the server.
    ///
    /// # Errors
    ///
    /// Returns `Error::MutationRejected` if the target is unknown or being
    /// deleted, or `Error::Persistence` if the cache write fails.
    pub async fn submit_mutation(
        &self,
        scope: SyncScope,
        target: EntityId,
        operation: Operation,
    ) -> Result<MutationHandle> {
        self.queue.submit(scope, target, operation).await
    }

    /// Pending mutations of the engine's queue.
    #[must_use]
    pub fn mutations(&self) -> &MutationQueue {
        &self.queue
    }

    /// Receive scope notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScopeEvent> {
        self.events.subscribe()
    }

    /// Channel for the push collaborator to deliver signals on.
    #[must_use]
    pub fn push_sender(&self) -> mpsc::Sender<PushSignal> {
        self.push_tx.clone()
    }

    /// Report a push notification. `None` resyncs every known scope.
    pub async fn on_push_signal(&self, scope: Option<SyncScope>) {
        let event = scope.map_or_else(PushEvent::unknown, PushEvent::for_scope);
        if self.push_tx.send(PushSignal::Event(event)).await.is_err() {
            debug!(account = %self.account, "Push dispatcher gone, signal dropped");
        }
    }

    /// Visible cached entities of a scope.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the cache read fails.
    pub async fn entities(&self, scope: &SyncScope) -> Result<Vec<Entity>> {
        let cached = self.cache.list(scope).await?;
        Ok(cached.into_iter().map(|row| row.entity).collect())
    }

    /// One visible cached entity.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the cache read fails.
    pub async fn entity(&self, scope: &SyncScope, id: &EntityId) -> Result<Option<Entity>> {
        let cached = self.cache.get(scope, id).await?;
        Ok(cached.filter(|row| !row.tombstoned).map(|row| row.entity))
    }

    /// Scopes synchronized at least once.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if the query fails.
    pub async fn scopes(&self) -> Result<Vec<SyncScope>> {
        self.tokens.known_scopes(self.account).await
    }

    /// Forget everything stored for the account.
    ///
    /// # Errors
    ///
    /// Returns `Error::Persistence` if a delete fails.
    pub async fn remove_account(&self) -> Result<()> {
        self.cache.clear_account(self.account).await?;
        self.tokens.forget_account(self.account).await?;
        info!(account = %self.account, "Removed account sync state");
        Ok(())
    }

    fn notify(&self, event: ScopeEvent) {
        events::publish(&self.events, event);
    }
}

#[async_trait]
impl ScopeSyncer for SyncEngine {
    async fn sync_scope(&self, scope: SyncScope, mode: SyncMode) {
        // Failures were already broadcast
        let _ = self.sync(&scope, mode).await;
    }

    async fn known_scopes(&self) -> Vec<SyncScope> {
        self.scopes().await.unwrap_or_else(|e| {
            warn!(account = %self.account, ?e, "Failed to list known scopes");
            Vec::new()
        })
    }
}
