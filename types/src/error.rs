//! Shared error taxonomy.
//!
//! Callers above the engine map these onto transport statuses (invalid →
//! 400, not found → 404, conflict → 409, feed fetch → 502, timeout → 504).
//! Fetch-layer failures are usually recorded on the feed row instead of
//! surfacing here, so one bad feed never aborts a batch.

use thiserror::Error;

use crate::feed::Feed;

pub type Result<T> = std::result::Result<T, Error>;

/// A feed URL that already exists, carried inside [`Error::Conflict`] so the
/// handler layer can point at the existing record.
#[derive(Debug, Clone)]
pub struct FeedConflict {
    pub existing: Feed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("feed already exists: {}", .0.existing.url)]
    Conflict(FeedConflict),

    #[error("feed fetch failed: {0}")]
    FeedFetch(String),

    /// The upstream served a null Anubis challenge: a permanent rejection,
    /// not a solvable puzzle.
    #[error("upstream rejected")]
    UpstreamRejected,

    #[error("retry limit exceeded")]
    RetryExceeded,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),

    #[error("request timed out")]
    RequestTimeout,

    #[error("a refresh is already in progress")]
    AlreadyRefreshing,
}

impl Error {
    /// Convenience constructor for [`Error::Invalid`].
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }
}
