//! Mutual exclusion keyed by scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::SyncScope;

/// One async lock per scope, created on first use.
///
/// Holders of different scopes never wait on each other.
#[derive(Debug, Default)]
pub struct ScopeLocks {
    locks: Mutex<HashMap<SyncScope, Arc<AsyncMutex<()>>>>,
}

impl ScopeLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, scope: &SyncScope) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(scope.clone()).or_default())
    }

    /// Wait for and take the lock of a scope.
    pub async fn lock(&self, scope: &SyncScope) -> OwnedMutexGuard<()> {
        self.slot(scope).lock_owned().await
    }

    /// Take the lock of a scope if nobody holds it.
    #[must_use]
    pub fn try_lock(&self, scope: &SyncScope) -> Option<OwnedMutexGuard<()>> {
        self.slot(scope).try_lock_owned().ok()
    }
}
