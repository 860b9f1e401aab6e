//! Feed refresh and content acquisition.
//!
//! The pipeline: the host scheduler gates each feed on per-host politeness,
//! the client factory builds a short-lived HTTP client, the fetcher issues a
//! conditional GET and parses the response, and on an interactive bot-check
//! page the Anubis solver earns a cookie and the fetch retries on a fresh
//! session. Readability extraction and icon backfill ride the same client
//! machinery.

use thiserror::Error;

pub mod anubis;
pub mod client;
pub mod fetcher;
pub mod host;
pub mod icons;
pub mod limits;
pub mod readability;
pub mod scheduler;

pub use anubis::AnubisSolver;
pub use client::{ClientConfig, ClientFactory, FingerprintSession, IpStack, ProxyConfig};
pub use fetcher::FeedFetcher;
pub use limits::RateLimits;
pub use readability::ReadabilityExtractor;
pub use scheduler::HostScheduler;

use rill_storage::StoreError;

/// Total budget for any single outbound request.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// User agent presented when the configuration supplies none.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/127.0.0.0 Safari/537.36";

pub type Result<T> = std::result::Result<T, FetchError>;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid proxy protocol: {0}")]
    InvalidProtocol(String),

    #[error("HTTP {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("feed parse failed: {0}")]
    Parse(String),

    /// Upstream served a null challenge: permanent rejection.
    #[error("upstream rejected")]
    UpstreamRejected,

    #[error("retry limit exceeded")]
    RetryExceeded,

    #[error("challenge failed: {0}")]
    Challenge(String),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<FetchError> for rill_types::Error {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidUrl(url) => Self::InvalidUrl(url),
            FetchError::InvalidProtocol(protocol) => Self::InvalidProtocol(protocol),
            FetchError::Timeout => Self::RequestTimeout,
            FetchError::UpstreamRejected => Self::UpstreamRejected,
            FetchError::RetryExceeded => Self::RetryExceeded,
            FetchError::Store(store) => store.into(),
            other => Self::FeedFetch(other.to_string()),
        }
    }
}
