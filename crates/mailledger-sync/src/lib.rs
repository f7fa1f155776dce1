//! # mailledger-sync
//!
//! Incremental synchronization engine for `MailLedger`.
//!
//! Keeps a local cache of mailboxes and emails consistent with the server
//! using opaque state tokens:
//! - **Token store** - durable per-scope "changes applied up to here" cursor
//! - **Delta fetcher** - paginated "changes since token" requests
//! - **Reconciler** - atomic merge of server deltas with local intents
//! - **Mutation queue** - optimistic local writes, delivered in order
//! - **Push dispatcher** - debounced, coalesced resync on push signals
//!
//! The transport is a collaborator behind the [`Transport`] trait; the
//! engine never manages connections itself.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mailledger_sync::{AccountId, Database, SyncConfig, SyncEngine, SyncScope, Transport};
//!
//! # async fn example(transport: Arc<dyn Transport>) -> mailledger_sync::Result<()> {
//! let database = Database::new("sync.db").await?;
//! let engine = Arc::new(SyncEngine::open(
//!     AccountId(1),
//!     SyncConfig::default(),
//!     database,
//!     transport,
//! ));
//! engine.start();
//!
//! let report = engine.trigger_sync(&SyncScope::mailboxes(AccountId(1))).await?;
//! println!("{} entities changed", report.changed.len());
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod config;
mod engine;
mod error;
mod events;
pub mod fetch;
mod locks;
pub mod mutation;
pub mod push;
pub mod reconcile;
pub mod retry;
pub mod store;
pub mod transport;
pub mod types;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncReport};
pub use error::{Error, ErrorKind, Result};
pub use events::ScopeEvent;
pub use fetch::DeltaFetcher;
pub use locks::ScopeLocks;
pub use mutation::{Keyword, MutationHandle, MutationId, MutationQueue, MutationStatus, Operation};
pub use push::{PushDispatcher, ScopeSyncer, SyncMode};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use retry::RetryPolicy;
pub use store::{Database, LocalCache, TokenStore};
pub use transport::{PushEvent, PushSignal, Request, Response, Transport, TransportError};
pub use types::{AccountId, ChangeSet, Entity, EntityId, EntityKind, StateToken, SyncScope};
