//! SQLite persistence for rill.
//!
//! One [`Store`] owns the database connection and exposes the repository
//! operations the engine consumes: feeds, entries, per-host rate limits, the
//! settings key-value table, and the AI artifact caches. The connection sits
//! behind a mutex; statements are short and callers hold the lock only for
//! the duration of one operation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

use rill_types::{Error as DomainError, Feed};

mod ai_cache;
mod domain_limits;
mod entries;
mod feeds;
mod migration;
mod settings;

pub use ai_cache::{AiArtifactKind, CacheClearCounts};
pub use entries::NewEntry;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("not found")]
    NotFound,

    #[error("feed already exists: {}", existing.url)]
    FeedConflict { existing: Box<Feed> },

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for DomainError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => DomainError::NotFound,
            StoreError::FeedConflict { existing } => {
                DomainError::Conflict(rill_types::FeedConflict {
                    existing: *existing,
                })
            }
            StoreError::Invalid(message) => DomainError::Invalid(message),
            other => DomainError::Invalid(other.to_string()),
        }
    }
}

/// The rill database.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS folders (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feeds (
            id INTEGER PRIMARY KEY,
            url TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            folder_id INTEGER REFERENCES folders(id) ON DELETE SET NULL,
            site_url TEXT,
            description TEXT,
            icon_path TEXT,
            kind TEXT NOT NULL DEFAULT 'article',
            etag TEXT,
            last_modified TEXT,
            error_message TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS entries (
            id INTEGER PRIMARY KEY,
            feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
            hash TEXT NOT NULL,
            title TEXT,
            url TEXT,
            content TEXT,
            readable_content TEXT,
            thumbnail_url TEXT,
            author TEXT,
            published_at TEXT,
            read INTEGER NOT NULL DEFAULT 0,
            starred INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_feed_hash
        ON entries(feed_id, hash);

        CREATE INDEX IF NOT EXISTS idx_entries_feed_read
        ON entries(feed_id, read);

        CREATE TABLE IF NOT EXISTS domain_rate_limits (
            host TEXT PRIMARY KEY,
            interval_seconds INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ai_summaries (
            id INTEGER PRIMARY KEY,
            entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            readability INTEGER NOT NULL,
            language TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(entry_id, readability, language)
        );

        CREATE TABLE IF NOT EXISTS ai_translations (
            id INTEGER PRIMARY KEY,
            entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            readability INTEGER NOT NULL,
            language TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(entry_id, readability, language)
        );

        CREATE TABLE IF NOT EXISTS ai_list_translations (
            id INTEGER PRIMARY KEY,
            entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            readability INTEGER NOT NULL,
            language TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(entry_id, readability, language)
        );
    ";

    /// Open or create the database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Invalid(format!(
                    "failed to create directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::initialize(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(Self::SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run the one-shot startup migration (hash backfill + dedup). Safe to
    /// call on every start; see [`migration`].
    pub fn migrate(&self) -> Result<()> {
        migration::run(&mut self.lock())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Format a timestamp for a TEXT column.
pub(crate) fn store_time(time: DateTime<Utc>) -> String {
    rill_types::format_time(time)
}

/// Parse a TEXT column timestamp.
pub(crate) fn read_time(text: &str) -> Result<DateTime<Utc>> {
    rill_types::parse_time(text).map_err(|e| StoreError::Corrupt(format!("bad timestamp: {e}")))
}

/// Parse an optional TEXT column timestamp.
pub(crate) fn read_time_opt(text: Option<String>) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| read_time(&t)).transpose()
}
