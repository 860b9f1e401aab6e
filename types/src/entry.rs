//! Entry records and list filtering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::feed::FeedKind;

/// A single feed item.
///
/// `(feed_id, hash)` is unique: within a feed the set of hashes is a set,
/// not a multiset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    /// 64 lowercase hex chars, see [`crate::hash::entry_hash`].
    pub hash: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content: Option<String>,
    /// Reader-mode HTML, filled lazily.
    pub readable_content: Option<String>,
    pub thumbnail_url: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub read: bool,
    pub starred: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Filter for entry listings. All predicates combine with AND.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub feed_id: Option<i64>,
    pub folder_id: Option<i64>,
    pub kind: Option<FeedKind>,
    pub unread_only: bool,
    pub starred_only: bool,
    pub has_thumbnail: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl EntryFilter {
    /// Smallest accepted page size.
    pub const MIN_LIMIT: u32 = 1;
    /// Largest accepted page size.
    pub const MAX_LIMIT: u32 = 101;
    /// Page size when the caller supplies none.
    pub const DEFAULT_LIMIT: u32 = 50;

    /// Caller-supplied limits clamp into `[1, 101]`; absent means 50.
    #[must_use]
    pub fn effective_limit(&self) -> u32 {
        self.limit
            .map_or(Self::DEFAULT_LIMIT, |l| l.clamp(Self::MIN_LIMIT, Self::MAX_LIMIT))
    }

    #[must_use]
    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }
}

/// Unread tally for one feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnreadCount {
    pub feed_id: i64,
    pub count: u64,
}
