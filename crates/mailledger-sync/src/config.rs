//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{Error, Result};

/// Default number of ids requested per page.
pub const DEFAULT_PAGE_LIMIT: usize = 50;

/// Maximum allowed page size.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Default push coalescing window.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(500);

/// Default bound on a single transport call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one sync engine instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Ids requested per page from the server.
    pub page_limit: usize,

    /// Push signals for a scope within this window collapse into one run.
    #[serde(with = "millis")]
    pub coalesce_window: Duration,

    /// Backoff policy for fetches and mutation sends.
    pub retry: RetryPolicy,

    /// A transport call that takes longer counts as a transient failure.
    #[serde(with = "millis")]
    pub request_timeout: Duration,

    /// Maximum number of mutation sends in flight at once.
    pub send_concurrency: usize,

    /// Buffered notifications per subscriber before the oldest are dropped.
    pub notification_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_limit: DEFAULT_PAGE_LIMIT,
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            retry: RetryPolicy::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            send_concurrency: 8,
            notification_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Creates a new configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the page size.
    #[must_use]
    pub fn page_limit(mut self, limit: usize) -> Self {
        self.page_limit = limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }

    /// Sets the push coalescing window.
    #[must_use]
    pub const fn coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the maximum number of concurrent mutation sends.
    #[must_use]
    pub fn send_concurrency(mut self, concurrency: usize) -> Self {
        self.send_concurrency = concurrency.max(1);
        self
    }

    /// Sets the notification buffer size.
    #[must_use]
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }

    /// Effective page size, clamped to the allowed range.
    #[must_use]
    pub fn effective_page_limit(&self) -> usize {
        self.page_limit.clamp(1, MAX_PAGE_LIMIT)
    }

    /// Load configuration from a JSON file.
    ///
    /// A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(Error::Config(format!("{}: {e}", path.display()))),
        };

        serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

/// Serialize durations as whole milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
