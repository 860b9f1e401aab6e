//! Feed records and per-host politeness configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a feed's entries are rendered as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    #[default]
    Article,
    Picture,
    Notification,
}

impl FeedKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Picture => "picture",
            Self::Notification => "notification",
        }
    }

    /// Parse a stored kind tag. Unknown tags fall back to `article` so a
    /// downgrade never makes rows unreadable.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text {
            "picture" => Self::Picture,
            "notification" => Self::Notification,
            _ => Self::Article,
        }
    }
}

/// A subscribed feed.
///
/// The fetcher owns `etag`, `last_modified`, `error_message`, `site_url` and
/// `icon_path`; user-facing writes (title, folder) land on disjoint columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    pub url: String,
    pub title: String,
    pub folder_id: Option<i64>,
    pub site_url: Option<String>,
    pub description: Option<String>,
    pub icon_path: Option<String>,
    pub kind: FeedKind,
    /// Conditional-GET state. Cleared only by an explicit cache reset.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Minimum interval between requests to one host. Zero (or no record at all)
/// means no minimum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRateLimit {
    pub host: String,
    pub interval_seconds: u64,
}
