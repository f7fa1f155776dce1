//! Synchronization scopes and state tokens.

use serde::{Deserialize, Serialize};

/// Unique identifier for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub i64);

impl AccountId {
    /// Create a new account ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The collection a scope synchronizes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Collection {
    /// The account's mailbox list.
    Mailboxes,
    /// The emails contained in one mailbox.
    Emails {
        /// Server id of the mailbox.
        mailbox_id: String,
    },
}

/// An account plus the collection being synchronized.
///
/// Scopes are immutable keys: every state token, cached entity and
/// pending mutation belongs to exactly one scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SyncScope {
    /// Owning account.
    pub account: AccountId,
    /// Collection within the account.
    pub collection: Collection,
}

impl SyncScope {
    /// Scope for an account's mailbox list.
    #[must_use]
    pub const fn mailboxes(account: AccountId) -> Self {
        Self {
            account,
            collection: Collection::Mailboxes,
        }
    }

    /// Scope for the emails of a mailbox.
    #[must_use]
    pub fn emails(account: AccountId, mailbox_id: impl Into<String>) -> Self {
        Self {
            account,
            collection: Collection::Emails {
                mailbox_id: mailbox_id.into(),
            },
        }
    }

    /// Stable storage key, e.g. `1/mailboxes` or `1/emails/INBOX`.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }

    /// Parses a key produced by [`SyncScope::key`].
    #[must_use]
    pub fn parse_key(key: &str) -> Option<Self> {
        let (account, rest) = key.split_once('/')?;
        let account = AccountId(account.parse().ok()?);

        if rest == "mailboxes" {
            return Some(Self::mailboxes(account));
        }

        let mailbox_id = rest.strip_prefix("emails/")?;
        if mailbox_id.is_empty() {
            return None;
        }
        Some(Self::emails(account, mailbox_id))
    }
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.collection {
            Collection::Mailboxes => write!(f, "{}/mailboxes", self.account),
            Collection::Emails { mailbox_id } => write!(f, "{}/emails/{mailbox_id}", self.account),
        }
    }
}

/// Opaque server-issued cursor: "changes applied up to here".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateToken(String);

impl StateToken {
    /// Wraps a token string without validation.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Parses a token received from the server, rejecting empty values.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        if value.trim().is_empty() {
            None
        } else {
            Some(Self(value.to_string()))
        }
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StateToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StateToken {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
