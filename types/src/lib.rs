//! Core domain types for rill.
//!
//! This crate holds the data model shared by every other member: feed and
//! entry records, the snowflake ID generator, the content fingerprint, the
//! RFC3339 time codec, and the error taxonomy. No IO beyond the system clock.

pub mod entry;
pub mod error;
pub mod feed;
pub mod hash;
pub mod ids;
pub mod task;
pub mod time;

pub use entry::{Entry, EntryFilter, UnreadCount};
pub use error::{Error, FeedConflict, Result};
pub use feed::{DomainRateLimit, Feed, FeedKind};
pub use hash::entry_hash;
pub use ids::next_id;
pub use task::{ImportResult, ImportState, ImportTask};
pub use time::{format_time, now, parse_time};

/// Settings keys understood by the engine. Stored in the settings KV table
/// so they can be changed at runtime without a restart.
pub mod settings_keys {
    /// Fallback user agent tried once when a fetch returns an HTTP error.
    pub const FALLBACK_USER_AGENT: &str = "fetch.fallback_user_agent";
    /// Target language for AI summaries and translations.
    pub const AI_SUMMARY_LANGUAGE: &str = "ai.summary_language";
    /// AI provider requests-per-minute limit.
    pub const AI_RATE_LIMIT: &str = "ai.rate_limit_rpm";
    /// Prefix under which Anubis cookies are cached.
    pub const ANUBIS_COOKIE_PREFIX: &str = "anubis_cookie:";
}
