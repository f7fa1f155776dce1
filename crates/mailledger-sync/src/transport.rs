//! Contract of the transport collaborator.
//!
//! The engine never opens connections itself. It sends typed requests
//! through a [`Transport`] and consumes push signals from a channel fed by
//! whoever owns the real-time socket or the platform push registration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::mutation::Operation;
use crate::types::{Entity, EntityId, StateToken, SyncScope};

/// A request the engine sends to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Changes since a state token.
    Changes {
        /// Scope to query.
        scope: SyncScope,
        /// Token to start from.
        since: StateToken,
        /// Maximum number of ids per page.
        max_changes: usize,
    },
    /// One page of the full id listing.
    Query {
        /// Scope to list.
        scope: SyncScope,
        /// Zero-based offset.
        position: usize,
        /// Maximum number of ids to return.
        limit: usize,
    },
    /// Current snapshots of a set of entities.
    Get {
        /// Scope the entities belong to.
        scope: SyncScope,
        /// Ids to fetch.
        ids: Vec<EntityId>,
    },
    /// Apply a local mutation on the server.
    Set {
        /// Scope of the target.
        scope: SyncScope,
        /// Target entity.
        target: EntityId,
        /// Operation to apply.
        operation: Operation,
    },
}

impl Request {
    /// Short method name for logging.
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Changes { .. } => "changes",
            Self::Query { .. } => "query",
            Self::Get { .. } => "get",
            Self::Set { .. } => "set",
        }
    }
}

/// A server response, one variant per request kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Response to [`Request::Changes`].
    Changes(ChangesPage),
    /// Response to [`Request::Query`].
    Query(QueryPage),
    /// Response to [`Request::Get`].
    Get(GetPage),
    /// Response to [`Request::Set`].
    Set(SetOutcome),
}

/// One page of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangesPage {
    /// Token the page starts from. Must echo the requested token.
    pub old_state: String,
    /// Token after applying this page.
    pub new_state: String,
    /// More pages follow from `new_state`.
    pub has_more_changes: bool,
    /// The server could not express the full history.
    pub truncated: bool,
    /// Created ids.
    pub created: Vec<EntityId>,
    /// Updated ids.
    pub updated: Vec<EntityId>,
    /// Destroyed ids.
    pub destroyed: Vec<EntityId>,
}

/// One page of the full listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPage {
    /// State of the collection the listing reflects.
    pub state: String,
    /// Offset of the first id in `ids`.
    pub position: usize,
    /// Ids in this page.
    pub ids: Vec<EntityId>,
    /// Total number of ids in the collection.
    pub total: usize,
}

/// Entity snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetPage {
    /// State of the collection when the snapshots were taken.
    pub state: String,
    /// Snapshots found.
    pub records: Vec<Entity>,
    /// Requested ids that no longer exist.
    pub not_found: Vec<EntityId>,
}

/// Result of a mutation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// The server applied the mutation.
    Accepted,
    /// The server declined the mutation.
    Rejected {
        /// Reason given by the server.
        reason: String,
    },
}

/// Error categories a server can report for a method call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// The state token is too old or unknown.
    CannotCalculateChanges,
    /// The request was malformed.
    InvalidArguments,
    /// The account may not perform this operation.
    Forbidden,
    /// The target does not exist.
    NotFound,
    /// Temporary server failure.
    ServerFail,
    /// Too many requests.
    RateLimited,
}

impl ServerErrorKind {
    /// Returns true if retrying later may succeed.
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        matches!(self, Self::ServerFail | Self::RateLimited)
    }
}

/// Failures reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The request timed out.
    #[error("request timed out")]
    Timeout,

    /// The server answered with a method error.
    #[error("server error {kind:?}: {description}")]
    Server {
        /// Error category.
        kind: ServerErrorKind,
        /// Free-form description.
        description: String,
    },
}

impl TransportError {
    /// Returns true if the request may be retried with backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Server { kind, .. } => kind.is_temporary(),
        }
    }
}

/// Request/response channel to the mail server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one request and wait for its response.
    async fn send(&self, request: Request) -> Result<Response, TransportError>;
}

/// A push notification from the real-time socket or platform push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    /// Scope that changed, or `None` when the push is too coarse to tell.
    pub scope_hint: Option<SyncScope>,
    /// When the signal was received.
    pub received_at: DateTime<Utc>,
}

impl PushEvent {
    /// Push naming one scope.
    #[must_use]
    pub fn for_scope(scope: SyncScope) -> Self {
        Self {
            scope_hint: Some(scope),
            received_at: Utc::now(),
        }
    }

    /// Push that only says "something changed".
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            scope_hint: None,
            received_at: Utc::now(),
        }
    }
}

/// Input of the push dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSignal {
    /// Something changed on the server.
    Event(PushEvent),
    /// The push connection dropped.
    Disconnected,
    /// The push connection is back; events may have been missed.
    Reconnected,
}
