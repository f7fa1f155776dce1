//! Turns push signals into coalesced sync runs.
//!
//! Signals for a scope that arrive within the coalescing window collapse
//! into one run. While a scope is being synced, further signals set a
//! single rerun flag instead of starting a second run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{PushEvent, PushSignal};
use crate::types::SyncScope;

/// How a scope should be synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncMode {
    /// Fetch changes since the stored token.
    Incremental,
    /// Fetch a full listing and replace the scope's contents with it.
    Full,
}

/// Something that can synchronize scopes on request.
#[async_trait]
pub trait ScopeSyncer: Send + Sync + 'static {
    /// Synchronize one scope. Failures are reported by the implementor.
    async fn sync_scope(&self, scope: SyncScope, mode: SyncMode);

    /// Every scope that has been synchronized before.
    async fn known_scopes(&self) -> Vec<SyncScope>;
}

#[derive(Debug, Default)]
struct Slot {
    /// When the coalescing window for the next run closes.
    due: Option<Instant>,
    mode: Option<SyncMode>,
    running: bool,
    rerun: Option<SyncMode>,
}

/// Debounces push signals and drives a [`ScopeSyncer`].
pub struct PushDispatcher<S: ?Sized> {
    syncer: Arc<S>,
    window: Duration,
    slots: HashMap<SyncScope, Slot>,
    running: JoinSet<SyncScope>,
}

impl<S: ScopeSyncer + ?Sized> PushDispatcher<S> {
    /// Creates a dispatcher coalescing signals within `window`.
    #[must_use]
    pub fn new(syncer: Arc<S>, window: Duration) -> Self {
        Self {
            syncer,
            window,
            slots: HashMap::new(),
            running: JoinSet::new(),
        }
    }

    /// Process signals until `cancel` fires or the channel closes.
    ///
    /// After the channel closes, pending windows are flushed and running
    /// syncs are awaited before returning.
    pub async fn run(mut self, mut signals: mpsc::Receiver<PushSignal>, cancel: CancellationToken) {
        info!(window = ?self.window, "Push dispatcher started");
        let mut closed = false;

        loop {
            if closed && self.running.is_empty() && self.next_due().is_none() {
                break;
            }

            let next_due = self.next_due();
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    self.running.shutdown().await;
                    break;
                }
                Some(joined) = self.running.join_next(), if !self.running.is_empty() => {
                    match joined {
                        Ok(scope) => self.finished(scope),
                        Err(e) => warn!(?e, "Sync task failed"),
                    }
                }
                () = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                    self.start_due();
                }
                signal = signals.recv(), if !closed => match signal {
                    Some(signal) => self.handle(signal).await,
                    None => {
                        debug!("Push channel closed, flushing pending scopes");
                        closed = true;
                        let now = Instant::now();
                        for slot in self.slots.values_mut() {
                            if slot.due.is_some() {
                                slot.due = Some(now);
                            }
                        }
                    }
                },
            }
        }

        info!("Push dispatcher stopped");
    }

    async fn handle(&mut self, signal: PushSignal) {
        match signal {
            PushSignal::Event(PushEvent {
                scope_hint: Some(scope),
                ..
            }) => self.schedule(scope, SyncMode::Incremental),
            PushSignal::Event(PushEvent {
                scope_hint: None, ..
            }) => {
                for scope in self.syncer.known_scopes().await {
                    self.schedule(scope, SyncMode::Incremental);
                }
            }
            PushSignal::Disconnected => {
                warn!("Push channel disconnected");
            }
            PushSignal::Reconnected => {
                // Signals may have been lost while disconnected
                info!("Push channel reconnected, resyncing every known scope");
                for scope in self.syncer.known_scopes().await {
                    self.schedule(scope, SyncMode::Full);
                }
            }
        }
    }

    fn schedule(&mut self, scope: SyncScope, mode: SyncMode) {
        let slot = self.slots.entry(scope).or_default();
        if slot.running {
            slot.rerun = slot.rerun.max(Some(mode));
            return;
        }
        slot.mode = slot.mode.max(Some(mode));
        if slot.due.is_none() {
            slot.due = Some(Instant::now() + self.window);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.slots.values().filter_map(|slot| slot.due).min()
    }

    fn start_due(&mut self) {
        let now = Instant::now();
        let due: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.due.is_some_and(|at| at <= now))
            .map(|(scope, _)| scope.clone())
            .collect();

        for scope in due {
            let Some(slot) = self.slots.get_mut(&scope) else {
                continue;
            };
            slot.due = None;
            let mode = slot.mode.take().unwrap_or(SyncMode::Incremental);
            self.spawn(scope, mode);
        }
    }

    fn spawn(&mut self, scope: SyncScope, mode: SyncMode) {
        if let Some(slot) = self.slots.get_mut(&scope) {
            slot.running = true;
        }
        debug!(%scope, ?mode, "Starting sync run");
        let syncer = Arc::clone(&self.syncer);
        self.running.spawn(async move {
            syncer.sync_scope(scope.clone(), mode).await;
            scope
        });
    }

    fn finished(&mut self, scope: SyncScope) {
        let Some(slot) = self.slots.get_mut(&scope) else {
            return;
        };
        slot.running = false;
        let rerun = slot.rerun.take();
        let idle = slot.due.is_none();

        if let Some(mode) = rerun {
            debug!(%scope, ?mode, "Rerunning after signals during sync");
            self.spawn(scope, mode);
        } else if idle {
            self.slots.remove(&scope);
        }
    }
}
