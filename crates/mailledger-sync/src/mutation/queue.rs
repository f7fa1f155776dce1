//! Optimistic mutation queue with per-entity ordering.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{MutationId, MutationStatus, Operation, PendingMutation, Target};
use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::events::{self, ScopeEvent};
use crate::locks::ScopeLocks;
use crate::retry::RetryPolicy;
use crate::store::LocalCache;
use crate::transport::{PushEvent, PushSignal, Request, Response, SetOutcome, Transport};
use crate::types::{EntityId, SyncScope};
use crate::{Error, Result};

type Lane = (SyncScope, EntityId);

struct Entry {
    mutation: PendingMutation,
    status_tx: watch::Sender<MutationStatus>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<MutationId, Entry>,
    /// Submission order per target entity. Only the head may be in flight.
    lanes: HashMap<Lane, VecDeque<MutationId>>,
}

impl QueueState {
    fn set_status(&mut self, id: MutationId, status: MutationStatus) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.mutation.status = status.clone();
            entry.status_tx.send_replace(status);
        }
    }

    /// Aborted sends go back to the head of their lane.
    fn requeue_in_flight(&mut self) -> usize {
        let mut requeued = 0;
        for entry in self.entries.values_mut() {
            if entry.mutation.status == MutationStatus::InFlight {
                entry.mutation.status = MutationStatus::Queued;
                entry.status_tx.send_replace(MutationStatus::Queued);
                requeued += 1;
            }
        }
        requeued
    }

    fn finish(&mut self, id: MutationId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        let lane_key = (entry.mutation.scope, entry.mutation.target);
        if let Some(lane) = self.lanes.get_mut(&lane_key) {
            lane.retain(|queued| *queued != id);
            if lane.is_empty() {
                self.lanes.remove(&lane_key);
            }
        }
    }

    fn unresolved_ops(
        &self,
        scope: &SyncScope,
        target: &EntityId,
        except: Option<MutationId>,
    ) -> Vec<Operation> {
        self.lanes
            .get(&(scope.clone(), target.clone()))
            .into_iter()
            .flatten()
            .filter(|id| Some(**id) != except)
            .filter_map(|id| self.entries.get(id))
            .filter(|entry| entry.mutation.status.is_unresolved())
            .map(|entry| entry.mutation.operation.clone())
            .collect()
    }
}

/// Handle returned by [`MutationQueue::submit`].
#[derive(Debug, Clone)]
pub struct MutationHandle {
    id: MutationId,
    status: watch::Receiver<MutationStatus>,
    stopped: watch::Receiver<bool>,
}

impl MutationHandle {
    /// Mutation id.
    #[must_use]
    pub const fn id(&self) -> MutationId {
        self.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> MutationStatus {
        self.status.borrow().clone()
    }

    /// Receiver that sees every status transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MutationStatus> {
        self.status.clone()
    }

    /// Wait until the mutation is confirmed or rejected.
    ///
    /// # Errors
    ///
    /// Returns `Error::MutationRejected` if the server declined the
    /// mutation, or `Error::Cancelled` if the sender stopped first. A
    /// cancelled mutation stays queued.
    pub async fn wait(mut self) -> Result<()> {
        loop {
            let current = self.status.borrow_and_update().clone();
            match current {
                MutationStatus::Confirmed => return Ok(()),
                MutationStatus::Rejected { reason } => {
                    return Err(Error::MutationRejected { reason });
                }
                MutationStatus::Queued | MutationStatus::InFlight => {}
            }
            if *self.stopped.borrow_and_update() {
                return Err(Error::Cancelled);
            }

            let sender_gone = tokio::select! {
                changed = self.status.changed() => changed.is_err(),
                stopped = self.stopped.changed() => stopped.is_err(),
            };
            if sender_gone {
                return final_outcome(&self.status.borrow());
            }
        }
    }
}

fn final_outcome(status: &MutationStatus) -> Result<()> {
    match status {
        MutationStatus::Confirmed => Ok(()),
        MutationStatus::Rejected { reason } => Err(Error::MutationRejected {
            reason: reason.clone(),
        }),
        MutationStatus::Queued | MutationStatus::InFlight => Err(Error::Cancelled),
    }
}

/// Buffers local write intents, applies them to the cache optimistically
/// and sends them to the server in per-entity submission order.
pub struct MutationQueue {
    cache: LocalCache,
    locks: Arc<ScopeLocks>,
    state: Mutex<QueueState>,
    wake: Notify,
    next_id: AtomicU64,
    refetch: Option<mpsc::Sender<PushSignal>>,
    events: Option<broadcast::Sender<ScopeEvent>>,
    /// Set while no sender loop is running after one was cancelled.
    stopped: watch::Sender<bool>,
    request_timeout: Duration,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueue")
            .field("pending", &self.len())
            .finish_non_exhaustive()
    }
}

impl MutationQueue {
    /// Creates a queue writing to `cache` and serializing on `locks`.
    ///
    /// `locks` must be the same table the reconciler uses so optimistic
    /// writes and server merges never interleave.
    #[must_use]
    pub fn new(cache: LocalCache, locks: Arc<ScopeLocks>) -> Self {
        Self {
            cache,
            locks,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
            next_id: AtomicU64::new(1),
            refetch: None,
            events: None,
            stopped: watch::channel(false).0,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Where to ask for a resync when a rollback has no snapshot to
    /// restore.
    #[must_use]
    pub fn with_refetch(mut self, signals: mpsc::Sender<PushSignal>) -> Self {
        self.refetch = Some(signals);
        self
    }

    /// Where to announce optimistic writes, rollbacks and confirmed
    /// removals.
    #[must_use]
    pub fn with_events(mut self, events: broadcast::Sender<ScopeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Bound every send to `timeout`.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an operation to the cache and queue it for sending.
    ///
    /// # Errors
    ///
    /// Returns `Error::MutationRejected` if the target is not cached or is
    /// already being deleted, or `Error::Persistence` if the optimistic
    /// write fails (nothing is queued in that case).
    pub async fn submit(
        &self,
        scope: SyncScope,
        target: EntityId,
        operation: Operation,
    ) -> Result<MutationHandle> {
        let _guard = self.locks.lock(&scope).await;

        let Some(mut cached) = self.cache.get(&scope, &target).await? else {
            return Err(Error::MutationRejected {
                reason: format!("{target} is not in the cache"),
            });
        };
        if cached.tombstoned {
            return Err(Error::MutationRejected {
                reason: format!("{target} is being deleted"),
            });
        }

        operation.apply(&mut cached.entity.fields);
        if operation == Operation::Delete {
            cached.tombstoned = true;
        }
        self.cache.put_local(&scope, &cached).await?;

        let id = MutationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(%id, %scope, %target, op = operation.name(), "Mutation queued");

        let mutation = PendingMutation::new(id, scope.clone(), target.clone(), operation);
        let (status_tx, status_rx) = watch::channel(MutationStatus::Queued);
        {
            let mut state = self.state();
            state
                .lanes
                .entry((scope.clone(), target.clone()))
                .or_default()
                .push_back(id);
            state.entries.insert(
                id,
                Entry {
                    mutation,
                    status_tx,
                },
            );
        }

        self.announce(scope, target);
        self.wake.notify_one();
        Ok(MutationHandle {
            id,
            status: status_rx,
            stopped: self.stopped.subscribe(),
        })
    }

    /// Snapshot of one mutation, if it is still pending.
    #[must_use]
    pub fn get(&self, id: MutationId) -> Option<PendingMutation> {
        self.state()
            .entries
            .get(&id)
            .map(|entry| entry.mutation.clone())
    }

    /// Pending mutations of a scope in submission order.
    #[must_use]
    pub fn pending_for(&self, scope: &SyncScope) -> Vec<PendingMutation> {
        let mut pending: Vec<_> = self
            .state()
            .entries
            .values()
            .filter(|entry| entry.mutation.scope == *scope)
            .map(|entry| entry.mutation.clone())
            .collect();
        pending.sort_by_key(|mutation| mutation.id);
        pending
    }

    /// Unresolved operations per target entity of a scope, each list in
    /// submission order.
    #[must_use]
    pub fn unresolved_for(&self, scope: &SyncScope) -> HashMap<EntityId, Vec<Operation>> {
        let state = self.state();
        state
            .lanes
            .keys()
            .filter(|(lane_scope, _)| lane_scope == scope)
            .map(|(_, target)| (target.clone(), state.unresolved_ops(scope, target, None)))
            .filter(|(_, ops)| !ops.is_empty())
            .collect()
    }

    /// Returns true if some unresolved mutation targets the entity.
    #[must_use]
    pub fn has_unresolved(&self, scope: &SyncScope, target: &EntityId) -> bool {
        !self.state().unresolved_ops(scope, target, None).is_empty()
    }

    /// Number of pending mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().entries.len()
    }

    /// Returns true if nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject every unresolved mutation targeting an entity the server
    /// destroyed. Must be called with the scope's lock held.
    pub(crate) fn reject_for_destroyed(
        &self,
        scope: &SyncScope,
        destroyed: &BTreeSet<EntityId>,
    ) -> Vec<MutationId> {
        let mut state = self.state();
        let mut rejected = Vec::new();

        for target in destroyed {
            let Some(lane) = state.lanes.remove(&(scope.clone(), target.clone())) else {
                continue;
            };
            for id in lane {
                if let Some(entry) = state.entries.remove(&id) {
                    info!(%id, %target, "Rejecting mutation on destroyed entity");
                    entry.status_tx.send_replace(MutationStatus::Rejected {
                        reason: format!("{target} was destroyed on the server"),
                    });
                    rejected.push(id);
                }
            }
        }

        rejected
    }

    /// Pick the oldest lane head that has not been sent yet.
    pub(crate) fn next_ready(&self) -> Option<PendingMutation> {
        let mut state = self.state();
        let id = state
            .lanes
            .values()
            .filter_map(|lane| lane.front().copied())
            .filter(|id| {
                state
                    .entries
                    .get(id)
                    .is_some_and(|entry| entry.mutation.status == MutationStatus::Queued)
            })
            .min()?;

        state.set_status(id, MutationStatus::InFlight);
        state.entries.get(&id).map(|entry| entry.mutation.clone())
    }

    /// Put aborted sends back in their lanes and wake every
    /// [`MutationHandle::wait`] with `Error::Cancelled`. The intents stay
    /// queued for the next sender.
    pub(crate) fn release_waiters(&self) {
        let requeued = self.state().requeue_in_flight();
        self.stopped.send_replace(true);
        debug!(requeued, "Released mutation waiters");
    }

    fn record_attempt(&self, id: MutationId) {
        if let Some(entry) = self.state().entries.get_mut(&id) {
            entry.mutation.attempts += 1;
        }
    }

    /// Send queued mutations until `cancel` fires.
    ///
    /// At most one mutation per entity is in flight; different entities
    /// are sent concurrently up to `concurrency`.
    pub async fn run_sender(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        concurrency: usize,
        cancel: CancellationToken,
    ) {
        let mut in_flight: JoinSet<(MutationId, Result<()>)> = JoinSet::new();
        self.stopped.send_replace(false);
        info!(concurrency, "Mutation sender started");

        loop {
            while in_flight.len() < concurrency.max(1) {
                let Some(mutation) = self.next_ready() else {
                    break;
                };

                let queue = Arc::clone(&self);
                let transport = Arc::clone(&transport);
                let retry = retry.clone();
                let cancel = cancel.child_token();
                in_flight.spawn(async move {
                    let result = queue
                        .deliver(transport.as_ref(), &mutation, &retry, &cancel)
                        .await;
                    (mutation.id, result)
                });
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    in_flight.abort_all();
                    self.release_waiters();
                    info!(pending = self.len(), "Mutation sender stopped");
                    return;
                }
                () = self.wake.notified() => {}
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match joined {
                        Ok((id, result)) => self.resolve(id, result).await,
                        Err(e) => warn!(?e, "Mutation send task failed"),
                    }
                }
            }
        }
    }

    async fn deliver(
        &self,
        transport: &dyn Transport,
        mutation: &PendingMutation,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        retry
            .run(mutation.operation.name(), cancel, || async move {
                self.record_attempt(mutation.id);
                debug!(id = %mutation.id, target = %mutation.target, "Sending mutation");

                let request = Request::Set {
                    scope: mutation.scope.clone(),
                    target: mutation.target.clone(),
                    operation: mutation.operation.clone(),
                };

                let Ok(response) =
                    tokio::time::timeout(self.request_timeout, transport.send(request)).await
                else {
                    return Err(Error::Transient(format!(
                        "set: no response within {:?}",
                        self.request_timeout
                    )));
                };

                match response {
                    Ok(Response::Set(SetOutcome::Accepted)) => Ok(()),
                    Ok(Response::Set(SetOutcome::Rejected { reason })) => {
                        Err(Error::MutationRejected { reason })
                    }
                    Ok(other) => Err(Error::Protocol(format!(
                        "unexpected response to set: {other:?}"
                    ))),
                    Err(e) if e.is_transient() => Err(Error::Transient(e.to_string())),
                    Err(e) => Err(Error::MutationRejected {
                        reason: e.to_string(),
                    }),
                }
            })
            .await
    }

    /// Record the server's answer: fold a confirmation into the server
    /// snapshot, or roll a rejection back.
    async fn resolve(&self, id: MutationId, result: Result<()>) {
        let Some(mutation) = self.get(id) else {
            debug!(%id, "Mutation already resolved");
            return;
        };

        let _guard = self.locks.lock(&mutation.scope).await;
        // A reconciliation may have rejected it while we waited for the lock
        if self.get(id).is_none() {
            return;
        }

        let (status, visible) = match result {
            Ok(()) => {
                let visible = match self.apply_confirmation(&mutation).await {
                    Ok(visible) => visible,
                    Err(e) => {
                        warn!(%id, ?e, "Failed to record confirmed mutation in cache");
                        false
                    }
                };
                info!(%id, target = %mutation.target, "Mutation confirmed");
                (MutationStatus::Confirmed, visible)
            }
            Err(err) => {
                let reason = match err {
                    Error::MutationRejected { reason } => reason,
                    other => other.to_string(),
                };
                let visible = match self.roll_back(&mutation).await {
                    Ok(visible) => visible,
                    Err(e) => {
                        warn!(%id, ?e, "Failed to roll back rejected mutation");
                        false
                    }
                };
                warn!(%id, target = %mutation.target, reason, "Mutation rejected");
                (MutationStatus::Rejected { reason }, visible)
            }
        };

        {
            let mut state = self.state();
            state.set_status(id, status);
            state.finish(id);
        }
        if visible {
            self.announce(mutation.scope, mutation.target);
        }
    }

    /// Returns true if the local view of the entity changed.
    async fn apply_confirmation(&self, mutation: &PendingMutation) -> Result<bool> {
        if mutation.operation == Operation::Delete {
            self.cache.remove(&mutation.scope, &mutation.target).await?;
            return Ok(true);
        }

        let Some(mut cached) = self.cache.get(&mutation.scope, &mutation.target).await? else {
            return Ok(false);
        };
        if let Some(server) = cached.server.as_mut() {
            mutation.operation.apply(server);
        }
        self.cache.put_local(&mutation.scope, &cached).await?;
        Ok(false)
    }

    /// Returns true if the cached row was rewritten.
    async fn roll_back(&self, mutation: &PendingMutation) -> Result<bool> {
        let Some(mut cached) = self.cache.get(&mutation.scope, &mutation.target).await? else {
            return Ok(false);
        };
        let Some(server) = cached.server.clone() else {
            self.request_refetch(&mutation.scope);
            return Ok(false);
        };

        match mutation.operation.target() {
            Target::Entity => cached.entity.fields = server,
            Target::Fields(names) => {
                for name in names {
                    match server.get(name) {
                        Some(value) => {
                            cached.entity.fields.insert(name.to_string(), value.clone());
                        }
                        None => {
                            cached.entity.fields.remove(name);
                        }
                    }
                }
            }
        }
        cached.tombstoned = false;

        // Later intents on the same entity still stand
        let later = self
            .state()
            .unresolved_ops(&mutation.scope, &mutation.target, Some(mutation.id));
        for op in &later {
            op.apply(&mut cached.entity.fields);
            if *op == Operation::Delete {
                cached.tombstoned = true;
            }
        }

        self.cache.put_local(&mutation.scope, &cached).await?;
        Ok(true)
    }

    fn announce(&self, scope: SyncScope, target: EntityId) {
        if let Some(sender) = &self.events {
            events::publish(sender, ScopeEvent::updated(scope, target));
        }
    }

    fn request_refetch(&self, scope: &SyncScope) {
        if let Some(signals) = &self.refetch
            && let Err(e) = signals.try_send(PushSignal::Event(PushEvent::for_scope(scope.clone())))
        {
            warn!(%scope, ?e, "Could not request refetch after rollback");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::store::Database;
    use crate::transport::TransportError;
    use crate::types::{AccountId, CachedEntity, Entity, EntityKind};

    /// Reports every send on a channel, then waits for a permit before
    /// answering.
    struct GatedTransport {
        started: mpsc::UnboundedSender<(EntityId, &'static str)>,
        permits: Arc<Semaphore>,
        reject: bool,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, request: Request) -> std::result::Result<Response, TransportError> {
            let Request::Set {
                target, operation, ..
            } = request
            else {
                return Err(TransportError::Network("unexpected".into()));
            };
            let _ = self.started.send((target, operation.name()));
            self.permits.acquire().await.unwrap().forget();

            if self.reject {
                Ok(Response::Set(SetOutcome::Rejected {
                    reason: "not allowed".into(),
                }))
            } else {
                Ok(Response::Set(SetOutcome::Accepted))
            }
        }
    }

    struct Harness {
        queue: Arc<MutationQueue>,
        cache: LocalCache,
        started: mpsc::UnboundedReceiver<(EntityId, &'static str)>,
        permits: Arc<Semaphore>,
        events: broadcast::Receiver<ScopeEvent>,
        cancel: CancellationToken,
    }

    fn scope() -> SyncScope {
        SyncScope::emails(AccountId(1), "INBOX")
    }

    async fn harness(reject: bool, ids: &[&str]) -> Harness {
        harness_with_timeout(reject, ids, Duration::from_secs(5)).await
    }

    async fn harness_with_timeout(reject: bool, ids: &[&str], timeout: Duration) -> Harness {
        let cache = LocalCache::new(Database::in_memory().await.unwrap());
        for id in ids {
            let entity = Entity::new(*id, EntityKind::Email)
                .with_field("subject", json!("Hi"))
                .with_field("flagged", json!(false));
            cache
                .put_local(&scope(), &CachedEntity::from_server(entity))
                .await
                .unwrap();
        }

        let (events_tx, events) = broadcast::channel(16);
        let queue = Arc::new(
            MutationQueue::new(cache.clone(), Arc::new(ScopeLocks::new()))
                .with_events(events_tx)
                .with_request_timeout(timeout),
        );
        let (started_tx, started) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(0));
        let transport = Arc::new(GatedTransport {
            started: started_tx,
            permits: Arc::clone(&permits),
            reject,
        });
        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&queue).run_sender(
            transport,
            RetryPolicy::none(),
            8,
            cancel.clone(),
        ));

        Harness {
            queue,
            cache,
            started,
            permits,
            events,
            cancel,
        }
    }

    async fn flagged(cache: &LocalCache, id: &str) -> serde_json::Value {
        cache
            .get(&scope(), &id.into())
            .await
            .unwrap()
            .unwrap()
            .entity
            .fields["flagged"]
            .clone()
    }

    #[tokio::test]
    async fn test_submit_applies_optimistically_and_confirms() {
        let mut h = harness(false, &["e1"]).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();

        // Visible before the server answers
        assert_eq!(flagged(&h.cache, "e1").await, json!(true));
        h.started.recv().await.unwrap();
        assert_eq!(handle.status(), MutationStatus::InFlight);

        h.permits.add_permits(1);
        handle.wait().await.unwrap();

        let cached = h.cache.get(&scope(), &"e1".into()).await.unwrap().unwrap();
        assert_eq!(cached.entity.fields["flagged"], json!(true));
        assert_eq!(cached.server.unwrap()["flagged"], json!(true));
        assert!(h.queue.is_empty());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_rejection_rolls_back() {
        let h = harness(true, &["e1"]).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();
        h.permits.add_permits(1);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::MutationRejected { reason } if reason == "not allowed"));
        assert_eq!(flagged(&h.cache, "e1").await, json!(false));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_same_entity_sent_in_submission_order() {
        let mut h = harness(false, &["e1"]).await;
        let first = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();
        let second = h
            .queue
            .submit(scope(), "e1".into(), Operation::mark_seen(true))
            .await
            .unwrap();

        let (_, op) = h.started.recv().await.unwrap();
        assert_eq!(op, "set-keyword");
        assert_eq!(second.status(), MutationStatus::Queued);

        // The second send must not start while the first is unresolved
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.started.try_recv().is_err());
        assert_eq!(second.status(), MutationStatus::Queued);

        h.permits.add_permits(1);
        first.wait().await.unwrap();
        h.started.recv().await.unwrap();
        h.permits.add_permits(1);
        second.wait().await.unwrap();
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_different_entities_in_flight_together() {
        let mut h = harness(false, &["e1", "e2"]).await;
        let a = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();
        let b = h
            .queue
            .submit(scope(), "e2".into(), Operation::flag(true))
            .await
            .unwrap();

        let mut started = vec![
            h.started.recv().await.unwrap().0,
            h.started.recv().await.unwrap().0,
        ];
        started.sort();
        assert_eq!(started, vec![EntityId::new("e1"), EntityId::new("e2")]);

        h.permits.add_permits(2);
        a.wait().await.unwrap();
        b.wait().await.unwrap();
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_delete_tombstones_then_removes() {
        let mut h = harness(false, &["e1"]).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::Delete)
            .await
            .unwrap();
        assert!(h.cache.list(&scope()).await.unwrap().is_empty());
        assert!(h.cache.get(&scope(), &"e1".into()).await.unwrap().is_some());

        h.started.recv().await.unwrap();
        h.permits.add_permits(1);
        handle.wait().await.unwrap();
        assert!(h.cache.get(&scope(), &"e1".into()).await.unwrap().is_none());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_target_rejected_immediately() {
        let h = harness(false, &[]).await;
        let err = h
            .queue
            .submit(scope(), "ghost".into(), Operation::flag(true))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MutationRejected { .. }));
        assert!(h.queue.is_empty());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_reject_for_destroyed() {
        let mut h = harness(false, &["e1"]).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();
        h.started.recv().await.unwrap();
        assert!(h.queue.has_unresolved(&scope(), &"e1".into()));

        let destroyed = BTreeSet::from([EntityId::new("e1")]);
        let rejected = h.queue.reject_for_destroyed(&scope(), &destroyed);
        assert_eq!(rejected, vec![handle.id()]);
        assert!(matches!(
            handle.status(),
            MutationStatus::Rejected { .. }
        ));

        // The late server answer is ignored
        h.permits.add_permits(1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.queue.is_empty());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_local_writes_are_announced() {
        let mut h = harness(true, &["e1"]).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();
        let optimistic = h.events.recv().await.unwrap();
        assert_eq!(optimistic, ScopeEvent::updated(scope(), "e1".into()));

        h.permits.add_permits(1);
        assert!(handle.wait().await.is_err());
        let rolled_back = h.events.recv().await.unwrap();
        assert_eq!(rolled_back, ScopeEvent::updated(scope(), "e1".into()));
        assert_eq!(flagged(&h.cache, "e1").await, json!(false));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_confirmed_delete_is_announced() {
        let mut h = harness(false, &["e1"]).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::Delete)
            .await
            .unwrap();
        h.events.recv().await.unwrap();

        h.permits.add_permits(1);
        handle.wait().await.unwrap();
        let removed = h.events.recv().await.unwrap();
        assert_eq!(removed, ScopeEvent::updated(scope(), "e1".into()));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_stopping_sender_releases_waiters() {
        let mut h = harness(false, &["e1"]).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();
        h.started.recv().await.unwrap();
        assert_eq!(handle.status(), MutationStatus::InFlight);

        h.cancel.cancel();
        let waited = tokio::time::timeout(Duration::from_secs(2), handle.clone().wait())
            .await
            .unwrap();
        assert!(matches!(waited, Err(Error::Cancelled)));

        // The intent survives and can be picked up again
        assert_eq!(handle.status(), MutationStatus::Queued);
        assert_eq!(h.queue.len(), 1);
        assert_eq!(flagged(&h.cache, "e1").await, json!(true));
        assert_eq!(h.queue.next_ready().unwrap().id, handle.id());
    }

    #[tokio::test]
    async fn test_unanswered_send_times_out_and_rolls_back() {
        let h = harness_with_timeout(false, &["e1"], Duration::from_millis(50)).await;
        let handle = h
            .queue
            .submit(scope(), "e1".into(), Operation::flag(true))
            .await
            .unwrap();

        // No permits are ever added, so the server never answers
        let err = tokio::time::timeout(Duration::from_secs(2), handle.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::MutationRejected { reason } if reason.contains("no response")));
        assert_eq!(flagged(&h.cache, "e1").await, json!(false));
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn test_pending_for_lists_submission_order() {
        let h = harness(false, &["e1", "e2"]).await;
        let first = h
            .queue
            .submit(scope(), "e2".into(), Operation::flag(true))
            .await
            .unwrap();
        let second = h
            .queue
            .submit(scope(), "e1".into(), Operation::mark_seen(true))
            .await
            .unwrap();

        let pending: Vec<_> = h.queue.pending_for(&scope()).iter().map(|m| m.id).collect();
        assert_eq!(pending, vec![first.id(), second.id()]);
        assert!(
            h.queue
                .pending_for(&SyncScope::mailboxes(AccountId(1)))
                .is_empty()
        );
        h.cancel.cancel();
    }
}
