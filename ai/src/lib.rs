//! Streaming AI summaries and translations.
//!
//! All provider traffic flows through one process-wide rate limiter. Results
//! stream to callers over a delta channel paired with an error channel;
//! cleanly finished streams are aggregated and persisted once.

use thiserror::Error;

pub mod limiter;
pub mod orchestrator;
pub mod provider;

pub use limiter::RateLimiter;
pub use orchestrator::{
    AiOrchestrator, BatchItem, BatchTranslation, SummaryStream, TranslationDelta,
    TranslationStream,
};
pub use provider::ProviderConfig;

use rill_storage::StoreError;

/// Target language used when settings name none.
pub const DEFAULT_LANGUAGE: &str = "zh-CN";

/// Requests per minute when no limit is configured.
pub const DEFAULT_RATE_LIMIT_RPM: u32 = 10;

/// Upper bound on items per batch-translate request.
pub const MAX_BATCH_ITEMS: usize = 100;

pub type Result<T> = std::result::Result<T, AiError>;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("api error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("stream ended before completion")]
    UnexpectedEof,

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for AiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
