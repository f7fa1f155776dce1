//! Delta fetcher: "changes since token" requests normalized into change sets.
//!
//! A fetch is never resumed. Every call starts again from the token it
//! was given, so a retry after a failure asks for exactly the same delta.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::retry::RetryPolicy;
use crate::transport::{Request, Response, ServerErrorKind, Transport, TransportError};
use crate::types::{ChangeSet, Collection, EntityId, EntityKind, StateToken, SyncScope};
use crate::{Error, Result};

/// How many times a full listing restarts when the collection changes
/// underneath it.
const MAX_LISTING_ATTEMPTS: usize = 2;

/// Issues bounded, paginated change requests for one scope at a time.
#[derive(Clone)]
pub struct DeltaFetcher {
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl std::fmt::Debug for DeltaFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaFetcher")
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl DeltaFetcher {
    /// Creates a fetcher sending through `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Bound every request to `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Fetch everything that changed in `scope` since `since`.
    ///
    /// Without a token this performs a full listing: `created` holds every
    /// current id and `from_token` is `None`. A truncated delta is returned
    /// as soon as the server signals it, with `truncated` set and no
    /// records.
    ///
    /// # Errors
    ///
    /// - `Error::Transient` on network failure or timeout
    /// - `Error::TokenInvalid` if the server rejects `since`
    /// - `Error::Protocol` on a malformed or unexpected payload
    /// - `Error::Cancelled` if `cancel` fires; the partial result is dropped
    pub async fn fetch_changes(
        &self,
        scope: &SyncScope,
        since: Option<&StateToken>,
        page_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet> {
        let page_limit = page_limit.max(1);
        let mut change_set = match since {
            Some(token) => self.fetch_delta(scope, token, page_limit, cancel).await?,
            None => self.fetch_listing(scope, page_limit, cancel).await?,
        };

        if !change_set.truncated {
            self.fetch_records(&mut change_set, page_limit, cancel).await?;
        }

        debug!(
            %scope,
            from = ?change_set.from_token.as_ref().map(StateToken::as_str),
            to = %change_set.to_token,
            created = change_set.created.len(),
            updated = change_set.updated.len(),
            destroyed = change_set.destroyed.len(),
            truncated = change_set.truncated,
            "Fetched changes"
        );
        Ok(change_set)
    }

    /// [`DeltaFetcher::fetch_changes`] retried with backoff on transient
    /// failures. Each retry restarts the paginated fetch from `since`.
    ///
    /// # Errors
    ///
    /// Same as [`DeltaFetcher::fetch_changes`]; a transient failure is only
    /// returned once the retry policy gives up.
    pub async fn fetch_with_retry(
        &self,
        scope: &SyncScope,
        since: Option<&StateToken>,
        page_limit: usize,
        retry: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet> {
        retry
            .run("fetch_changes", cancel, move || {
                self.fetch_changes(scope, since, page_limit, cancel)
            })
            .await
    }

    async fn fetch_delta(
        &self,
        scope: &SyncScope,
        since: &StateToken,
        page_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet> {
        let mut change_set = ChangeSet::new(scope.clone(), Some(since.clone()), since.clone());
        let mut cursor = since.clone();

        loop {
            let request = Request::Changes {
                scope: scope.clone(),
                since: cursor.clone(),
                max_changes: page_limit,
            };
            let Response::Changes(page) = self.call(request, cancel).await? else {
                return Err(Error::Protocol("expected a changes response".into()));
            };

            if page.old_state != cursor.as_str() {
                return Err(Error::Protocol(format!(
                    "changes page starts at {:?}, requested {cursor}",
                    page.old_state
                )));
            }

            if page.truncated {
                warn!(%scope, since = %since, "Server truncated the delta");
                change_set.truncated = true;
                change_set.records.clear();
                if let Some(token) = StateToken::parse(&page.new_state) {
                    change_set.to_token = token;
                }
                return Ok(change_set);
            }

            let next = StateToken::parse(&page.new_state)
                .ok_or_else(|| Error::Protocol("changes page without a new state".into()))?;
            change_set.absorb_page(page.created, page.updated, page.destroyed);

            if !page.has_more_changes {
                change_set.to_token = next;
                return Ok(change_set);
            }
            if next == cursor {
                return Err(Error::Protocol(
                    "server reported more changes without advancing the state".into(),
                ));
            }
            cursor = next;
        }
    }

    async fn fetch_listing(
        &self,
        scope: &SyncScope,
        page_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<ChangeSet> {
        for attempt in 1..=MAX_LISTING_ATTEMPTS {
            if let Some((state, ids)) = self.list_once(scope, page_limit, cancel).await? {
                let mut change_set = ChangeSet::new(scope.clone(), None, state);
                change_set.created.extend(ids);
                return Ok(change_set);
            }
            debug!(%scope, attempt, "Collection changed during listing, restarting");
        }

        Err(Error::Transient(format!(
            "{scope} kept changing during a full listing"
        )))
    }

    /// One pass over the listing. `None` if the collection state changed
    /// between pages.
    async fn list_once(
        &self,
        scope: &SyncScope,
        page_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<(StateToken, Vec<EntityId>)>> {
        let mut ids = Vec::new();
        let mut state: Option<String> = None;

        loop {
            let request = Request::Query {
                scope: scope.clone(),
                position: ids.len(),
                limit: page_limit,
            };
            let Response::Query(page) = self.call(request, cancel).await? else {
                return Err(Error::Protocol("expected a query response".into()));
            };

            if page.position != ids.len() {
                return Err(Error::Protocol(format!(
                    "query page at position {}, requested {}",
                    page.position,
                    ids.len()
                )));
            }
            let first_state = state.get_or_insert_with(|| page.state.clone());
            if *first_state != page.state {
                return Ok(None);
            }

            let received = page.ids.len();
            ids.extend(page.ids);

            if ids.len() >= page.total {
                let token = state
                    .as_deref()
                    .and_then(StateToken::parse)
                    .ok_or_else(|| Error::Protocol("query page without a state".into()))?;
                return Ok(Some((token, ids)));
            }
            if received == 0 {
                return Err(Error::Protocol(format!(
                    "empty query page at {} of {}",
                    ids.len(),
                    page.total
                )));
            }
        }
    }

    /// Attach server snapshots for created and updated ids. Ids the server
    /// no longer has are folded into `destroyed`.
    async fn fetch_records(
        &self,
        change_set: &mut ChangeSet,
        page_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let expected = expected_kind(&change_set.scope);
        let wanted = change_set.ids_to_fetch();
        let mut missing = Vec::new();

        for chunk in wanted.chunks(page_limit) {
            let request = Request::Get {
                scope: change_set.scope.clone(),
                ids: chunk.to_vec(),
            };
            let Response::Get(page) = self.call(request, cancel).await? else {
                return Err(Error::Protocol("expected a get response".into()));
            };

            for record in page.records {
                if !chunk.contains(&record.id) {
                    return Err(Error::Protocol(format!("unrequested record {}", record.id)));
                }
                if record.kind != expected {
                    return Err(Error::Protocol(format!(
                        "record {} is a {}, expected a {}",
                        record.id,
                        record.kind.as_str(),
                        expected.as_str()
                    )));
                }
                change_set.records.insert(record.id.clone(), record);
            }

            missing.extend(
                chunk
                    .iter()
                    .filter(|id| !change_set.records.contains_key(*id))
                    .cloned(),
            );
        }

        if !missing.is_empty() {
            debug!(scope = %change_set.scope, count = missing.len(), "Records vanished before get");
            change_set.absorb_page([], [], missing);
        }
        Ok(())
    }

    async fn call(&self, request: Request, cancel: &CancellationToken) -> Result<Response> {
        let method = request.method();
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            response = tokio::time::timeout(self.request_timeout, self.transport.send(request)) => {
                match response {
                    Ok(response) => response.map_err(|e| map_transport_error(method, e)),
                    Err(_) => Err(Error::Transient(format!(
                        "{method}: no response within {:?}",
                        self.request_timeout
                    ))),
                }
            }
        }
    }
}

const fn expected_kind(scope: &SyncScope) -> EntityKind {
    match scope.collection {
        Collection::Mailboxes => EntityKind::Mailbox,
        Collection::Emails { .. } => EntityKind::Email,
    }
}

fn map_transport_error(method: &str, err: TransportError) -> Error {
    match err {
        TransportError::Network(_) | TransportError::Timeout => {
            Error::Transient(format!("{method}: {err}"))
        }
        TransportError::Server {
            kind: ServerErrorKind::CannotCalculateChanges,
            description,
        } => Error::TokenInvalid(description),
        TransportError::Server { kind, .. } if kind.is_temporary() => {
            Error::Transient(format!("{method}: {err}"))
        }
        TransportError::Server { .. } => Error::Protocol(format!("{method}: {err}")),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::transport::{ChangesPage, GetPage, QueryPage};
    use crate::types::{AccountId, Entity};

    type Reply = std::result::Result<Response, TransportError>;

    /// Answers requests from a fixed script and records what was asked.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<Request>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::default(),
            })
        }

        fn requests(&self) -> Vec<Request> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: Request) -> Reply {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(TransportError::Network("script exhausted".into())))
        }
    }

    fn scope() -> SyncScope {
        SyncScope::emails(AccountId(1), "INBOX")
    }

    fn ids(values: &[&str]) -> Vec<EntityId> {
        values.iter().map(|v| EntityId::new(*v)).collect()
    }

    fn email(id: &str) -> Entity {
        Entity::new(id, EntityKind::Email).with_field("subject", json!(format!("about {id}")))
    }

    fn changes(old: &str, new: &str, more: bool, created: &[&str], destroyed: &[&str]) -> Reply {
        Ok(Response::Changes(ChangesPage {
            old_state: old.into(),
            new_state: new.into(),
            has_more_changes: more,
            truncated: false,
            created: ids(created),
            updated: Vec::new(),
            destroyed: ids(destroyed),
        }))
    }

    fn get(records: &[&str]) -> Reply {
        Ok(Response::Get(GetPage {
            state: "s".into(),
            records: records.iter().map(|id| email(id)).collect(),
            not_found: Vec::new(),
        }))
    }

    fn query(state: &str, position: usize, page: &[&str], total: usize) -> Reply {
        Ok(Response::Query(QueryPage {
            state: state.into(),
            position,
            ids: ids(page),
            total,
        }))
    }

    #[tokio::test]
    async fn test_full_listing_without_token() {
        let transport = ScriptedTransport::new(vec![
            query("t1", 0, &["e1", "e2"], 3),
            query("t1", 2, &["e3"], 3),
            get(&["e1", "e2"]),
            get(&["e3"]),
        ]);
        let fetcher = DeltaFetcher::new(transport.clone());

        let set = fetcher
            .fetch_changes(&scope(), None, 2, &CancellationToken::new())
            .await
            .unwrap();

        assert!(set.is_full_listing());
        assert_eq!(set.to_token, "t1".into());
        assert_eq!(set.created.len(), 3);
        assert_eq!(set.records.len(), 3);
        assert_eq!(transport.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_listing_restarts_when_state_moves() {
        let transport = ScriptedTransport::new(vec![
            query("t1", 0, &["e1"], 2),
            query("t2", 1, &["e2"], 2),
            query("t2", 0, &["e1"], 2),
            query("t2", 1, &["e2"], 2),
            get(&["e1"]),
            get(&["e2"]),
        ]);
        let fetcher = DeltaFetcher::new(transport);

        let set = fetcher
            .fetch_changes(&scope(), None, 1, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(set.to_token, "t2".into());
        assert_eq!(set.created.len(), 2);
    }

    #[tokio::test]
    async fn test_delta_paginates_and_accumulates() {
        let transport = ScriptedTransport::new(vec![
            changes("t1", "t2", true, &["e3"], &["e1"]),
            changes("t2", "t3", false, &["e4"], &[]),
            get(&["e3", "e4"]),
        ]);
        let fetcher = DeltaFetcher::new(transport.clone());

        let set = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(set.from_token, Some("t1".into()));
        assert_eq!(set.to_token, "t3".into());
        assert_eq!(set.created.len(), 2);
        assert!(set.destroyed.contains(&EntityId::new("e1")));

        let requests = transport.requests();
        assert!(matches!(&requests[1], Request::Changes { since, .. } if since.as_str() == "t2"));
    }

    #[tokio::test]
    async fn test_truncated_stops_paginating() {
        let transport = ScriptedTransport::new(vec![Ok(Response::Changes(ChangesPage {
            old_state: "t1".into(),
            new_state: "t9".into(),
            has_more_changes: true,
            truncated: true,
            ..ChangesPage::default()
        }))]);
        let fetcher = DeltaFetcher::new(transport.clone());

        let set = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &CancellationToken::new())
            .await
            .unwrap();
        assert!(set.truncated);
        assert!(set.records.is_empty());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cannot_calculate_changes_is_token_invalid() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Server {
            kind: ServerErrorKind::CannotCalculateChanges,
            description: "too old".into(),
        })]);
        let fetcher = DeltaFetcher::new(transport);

        let err = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenInvalid(_)));
    }

    #[tokio::test]
    async fn test_mismatched_old_state_is_protocol_error() {
        let transport = ScriptedTransport::new(vec![changes("t0", "t2", false, &[], &[])]);
        let fetcher = DeltaFetcher::new(transport);

        let err = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_wrong_record_kind_is_protocol_error() {
        let transport = ScriptedTransport::new(vec![
            changes("t1", "t2", false, &["e1"], &[]),
            Ok(Response::Get(GetPage {
                state: "t2".into(),
                records: vec![Entity::new("e1", EntityKind::Mailbox)],
                not_found: Vec::new(),
            })),
        ]);
        let fetcher = DeltaFetcher::new(transport);

        let err = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_vanished_records_become_destroyed() {
        let transport = ScriptedTransport::new(vec![
            Ok(Response::Changes(ChangesPage {
                old_state: "t1".into(),
                new_state: "t2".into(),
                updated: ids(&["e1", "e2"]),
                ..ChangesPage::default()
            })),
            get(&["e1"]),
        ]);
        let fetcher = DeltaFetcher::new(transport);

        let set = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(set.updated.len(), 1);
        assert!(set.destroyed.contains(&EntityId::new("e2")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_restarts_from_original_token() {
        let transport = ScriptedTransport::new(vec![
            changes("t1", "t2", true, &[], &["e1"]),
            Err(TransportError::Timeout),
            changes("t1", "t2", true, &[], &["e1"]),
            changes("t2", "t3", false, &[], &["e2"]),
        ]);
        let fetcher = DeltaFetcher::new(transport.clone());
        let retry = RetryPolicy::default()
            .delays(Duration::from_millis(10), Duration::from_millis(10))
            .jitter(false);

        let set = fetcher
            .fetch_with_retry(
                &scope(),
                Some(&"t1".into()),
                50,
                &retry,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(set.to_token, "t3".into());
        assert_eq!(set.destroyed.len(), 2);

        let sinces: Vec<_> = transport
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::Changes { since, .. } => Some(since.as_str().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(sinces, vec!["t1", "t2", "t1", "t2"]);
    }

    #[tokio::test]
    async fn test_cancelled_fetch() {
        let transport = ScriptedTransport::new(vec![changes("t1", "t2", false, &[], &[])]);
        let fetcher = DeltaFetcher::new(transport);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    /// Answers the first `answered` requests from a script, then never
    /// answers again.
    struct StallingTransport {
        script: ScriptedTransport,
        answered: usize,
        stalled: Notify,
    }

    #[async_trait]
    impl Transport for StallingTransport {
        async fn send(&self, request: Request) -> Reply {
            if self.script.requests().len() >= self.answered {
                self.stalled.notify_one();
                return std::future::pending().await;
            }
            self.script.send(request).await
        }
    }

    fn stalling(replies: Vec<Reply>) -> Arc<StallingTransport> {
        Arc::new(StallingTransport {
            answered: replies.len(),
            script: ScriptedTransport {
                replies: Mutex::new(replies.into()),
                requests: Mutex::default(),
            },
            stalled: Notify::new(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out_as_transient() {
        let transport = stalling(Vec::new());
        let fetcher = DeltaFetcher::new(transport).with_timeout(Duration::from_secs(5));

        let err = fetcher
            .fetch_changes(&scope(), Some(&"t1".into()), 50, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried_then_reported() {
        let transport = stalling(Vec::new());
        let fetcher = DeltaFetcher::new(transport).with_timeout(Duration::from_secs(1));
        let retry = RetryPolicy::default()
            .max_attempts(2)
            .delays(Duration::from_millis(10), Duration::from_millis(10))
            .jitter(false);

        let started = tokio::time::Instant::now();
        let err = fetcher
            .fetch_with_retry(&scope(), None, 50, &retry, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient(_)));
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_cancel_while_second_page_pending() {
        let transport = stalling(vec![changes("t1", "t2", true, &["e3"], &["e1"])]);
        let fetcher = DeltaFetcher::new(transport.clone());
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                fetcher
                    .fetch_changes(&scope(), Some(&"t1".into()), 1, &cancel)
                    .await
            })
        };

        transport.stalled.notified().await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let requests = transport.script.requests();
        assert_eq!(requests.len(), 1);
        assert!(matches!(&requests[0], Request::Changes { since, .. } if since.as_str() == "t1"));
    }
}
