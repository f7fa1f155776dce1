//! Error types for the sync engine.

use thiserror::Error;

/// Errors that can occur while synchronizing.
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure or timeout talking to the server. Safe to retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// The server no longer accepts the stored state token.
    #[error("State token rejected by server: {0}")]
    TokenInvalid(String),

    /// The server sent a payload the engine could not interpret.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Local storage failed.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The server declined a local mutation.
    #[error("Mutation rejected: {reason}")]
    MutationRejected {
        /// Reason given by the server (or by the retry policy).
        reason: String,
    },

    /// The operation was cancelled before it completed.
    #[error("Operation cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns true if the caller may retry the operation with backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::TokenInvalid(_) => ErrorKind::TokenInvalid,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::MutationRejected { .. } => ErrorKind::MutationRejected,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(format!("stored record is not valid JSON: {err}"))
    }
}

/// Discriminant of [`Error`], cheap to clone into notification events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Transient`].
    Transient,
    /// See [`Error::TokenInvalid`].
    TokenInvalid,
    /// See [`Error::Protocol`].
    Protocol,
    /// See [`Error::Persistence`].
    Persistence,
    /// See [`Error::MutationRejected`].
    MutationRejected,
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::Config`].
    Config,
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
