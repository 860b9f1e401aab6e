//! Feed repository operations.

use rusqlite::{OptionalExtension, Row, params};

use rill_types::{Feed, FeedKind};

use crate::{Result, Store, StoreError, read_time, store_time};

const FEED_COLUMNS: &str = "id, url, title, folder_id, site_url, description, icon_path, \
     kind, etag, last_modified, error_message, created_at, updated_at";

fn feed_from_row(row: &Row<'_>) -> rusqlite::Result<(Feed, String, String)> {
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    let kind: String = row.get(7)?;
    Ok((
        Feed {
            id: row.get(0)?,
            url: row.get(1)?,
            title: row.get(2)?,
            folder_id: row.get(3)?,
            site_url: row.get(4)?,
            description: row.get(5)?,
            icon_path: row.get(6)?,
            kind: FeedKind::parse(&kind),
            etag: row.get(8)?,
            last_modified: row.get(9)?,
            error_message: row.get(10)?,
            created_at: chrono::DateTime::UNIX_EPOCH,
            updated_at: chrono::DateTime::UNIX_EPOCH,
        },
        created_at,
        updated_at,
    ))
}

fn finish_feed(parts: (Feed, String, String)) -> Result<Feed> {
    let (mut feed, created_at, updated_at) = parts;
    feed.created_at = read_time(&created_at)?;
    feed.updated_at = read_time(&updated_at)?;
    Ok(feed)
}

impl Store {
    /// Insert a new feed. A URL collision surfaces the existing record as
    /// [`StoreError::FeedConflict`].
    pub fn create_feed(&self, feed: &Feed) -> Result<()> {
        if let Some(existing) = self.find_feed_by_url(&feed.url)? {
            return Err(StoreError::FeedConflict {
                existing: Box::new(existing),
            });
        }

        self.lock().execute(
            "INSERT INTO feeds (id, url, title, folder_id, site_url, description, icon_path, \
             kind, etag, last_modified, error_message, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                feed.id,
                feed.url,
                feed.title,
                feed.folder_id,
                feed.site_url,
                feed.description,
                feed.icon_path,
                feed.kind.as_str(),
                feed.etag,
                feed.last_modified,
                feed.error_message,
                store_time(feed.created_at),
                store_time(feed.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_feed(&self, id: i64) -> Result<Feed> {
        let parts = self
            .lock()
            .query_row(
                &format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?1"),
                params![id],
                feed_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        finish_feed(parts)
    }

    /// Batched lookup; IDs that do not exist are simply absent from the
    /// result.
    pub fn get_feeds_by_ids(&self, ids: &[i64]) -> Result<Vec<Feed>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id IN ({placeholders}) ORDER BY id");
        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(ids.iter()), feed_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .map(finish_feed)
            .collect()
    }

    pub fn find_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        self.lock()
            .query_row(
                &format!("SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?1"),
                params![url],
                feed_from_row,
            )
            .optional()?
            .map(finish_feed)
            .transpose()
    }

    /// All feeds, optionally restricted to a folder, title-ordered.
    pub fn list_feeds(&self, folder_id: Option<i64>) -> Result<Vec<Feed>> {
        let conn = self.lock();
        let mut collected = Vec::new();
        match folder_id {
            Some(folder_id) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FEED_COLUMNS} FROM feeds WHERE folder_id = ?1 \
                     ORDER BY title COLLATE NOCASE"
                ))?;
                let rows = stmt.query_map(params![folder_id], feed_from_row)?;
                for row in rows {
                    collected.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {FEED_COLUMNS} FROM feeds ORDER BY title COLLATE NOCASE"
                ))?;
                let rows = stmt.query_map([], feed_from_row)?;
                for row in rows {
                    collected.push(row?);
                }
            }
        }
        drop(conn);
        collected.into_iter().map(finish_feed).collect()
    }

    /// Feeds with no cached icon yet, for the backfill pass.
    pub fn list_feeds_without_icon(&self) -> Result<Vec<Feed>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds \
             WHERE icon_path IS NULL OR icon_path = '' ORDER BY id"
        ))?;
        let rows = stmt.query_map([], feed_from_row)?;
        let collected = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);
        collected.into_iter().map(finish_feed).collect()
    }

    /// Update the user-editable columns (url, title, folder, description).
    pub fn update_feed(&self, feed: &Feed) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE feeds SET url = ?2, title = ?3, folder_id = ?4, description = ?5, \
             updated_at = ?6 WHERE id = ?1",
            params![
                feed.id,
                feed.url,
                feed.title,
                feed.folder_id,
                feed.description,
                store_time(rill_types::now()),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_feed_icon_path(&self, id: i64, icon_path: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE feeds SET icon_path = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, icon_path, store_time(rill_types::now())],
        )?;
        Ok(())
    }

    pub fn update_feed_site_url(&self, id: i64, site_url: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE feeds SET site_url = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, site_url, store_time(rill_types::now())],
        )?;
        Ok(())
    }

    /// Record (or clear, with `None`) the feed's last fetch error.
    pub fn update_feed_error_message(&self, id: i64, message: Option<&str>) -> Result<()> {
        self.lock().execute(
            "UPDATE feeds SET error_message = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, message, store_time(rill_types::now())],
        )?;
        Ok(())
    }

    /// Store the upstream's conditional-GET validators.
    pub fn update_feed_conditional_get(
        &self,
        id: i64,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        self.lock().execute(
            "UPDATE feeds SET etag = ?2, last_modified = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, etag, last_modified, store_time(rill_types::now())],
        )?;
        Ok(())
    }

    pub fn update_feed_kind(&self, id: i64, kind: FeedKind) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE feeds SET kind = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, kind.as_str(), store_time(rill_types::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_feed_kind_by_folder(&self, folder_id: i64, kind: FeedKind) -> Result<u64> {
        let changed = self.lock().execute(
            "UPDATE feeds SET kind = ?2, updated_at = ?3 WHERE folder_id = ?1",
            params![folder_id, kind.as_str(), store_time(rill_types::now())],
        )?;
        Ok(changed as u64)
    }

    /// Delete a feed; entries cascade.
    pub fn delete_feed(&self, id: i64) -> Result<()> {
        let changed = self
            .lock()
            .execute("DELETE FROM feeds WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn delete_feeds(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let changed = self.lock().execute(
            &format!("DELETE FROM feeds WHERE id IN ({placeholders})"),
            rusqlite::params_from_iter(ids.iter()),
        )?;
        Ok(changed as u64)
    }

    pub fn clear_all_icon_paths(&self) -> Result<u64> {
        let changed = self
            .lock()
            .execute("UPDATE feeds SET icon_path = NULL", [])?;
        Ok(changed as u64)
    }

    /// Explicit cache reset: the only operation allowed to drop
    /// ETag/Last-Modified state.
    pub fn clear_all_conditional_get(&self) -> Result<u64> {
        let changed = self
            .lock()
            .execute("UPDATE feeds SET etag = NULL, last_modified = NULL", [])?;
        Ok(changed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_feed(id: i64, url: &str) -> Feed {
        let now = rill_types::now();
        Feed {
            id,
            url: url.to_string(),
            title: format!("Feed {id}"),
            folder_id: None,
            site_url: None,
            description: None,
            icon_path: None,
            kind: FeedKind::Article,
            etag: None,
            last_modified: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn create_and_get_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let feed = sample_feed(1, "https://example.com/feed.xml");
        store.create_feed(&feed).unwrap();

        let loaded = store.get_feed(1).unwrap();
        assert_eq!(loaded.url, feed.url);
        assert_eq!(loaded.title, feed.title);
        assert_eq!(loaded.kind, FeedKind::Article);
    }

    #[test]
    fn duplicate_url_reports_conflict_with_existing() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_feed(&sample_feed(1, "https://example.com/feed.xml"))
            .unwrap();

        let err = store
            .create_feed(&sample_feed(2, "https://example.com/feed.xml"))
            .unwrap_err();
        match err {
            StoreError::FeedConflict { existing } => assert_eq!(existing.id, 1),
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn error_message_set_and_clear() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_feed(&sample_feed(1, "https://example.com/feed.xml"))
            .unwrap();

        store.update_feed_error_message(1, Some("HTTP 502")).unwrap();
        assert_eq!(store.get_feed(1).unwrap().error_message.as_deref(), Some("HTTP 502"));

        store.update_feed_error_message(1, None).unwrap();
        assert_eq!(store.get_feed(1).unwrap().error_message, None);
    }

    #[test]
    fn conditional_get_survives_until_explicit_reset() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_feed(&sample_feed(1, "https://example.com/feed.xml"))
            .unwrap();

        store
            .update_feed_conditional_get(1, Some("\"abc\""), Some("Mon, 01 Jan 2024 00:00:00 GMT"))
            .unwrap();
        let feed = store.get_feed(1).unwrap();
        assert_eq!(feed.etag.as_deref(), Some("\"abc\""));

        store.clear_all_conditional_get().unwrap();
        let feed = store.get_feed(1).unwrap();
        assert_eq!(feed.etag, None);
        assert_eq!(feed.last_modified, None);
    }

    #[test]
    fn get_by_ids_skips_missing() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_feed(&sample_feed(1, "https://a.example/feed"))
            .unwrap();
        store
            .create_feed(&sample_feed(2, "https://b.example/feed"))
            .unwrap();

        let feeds = store.get_feeds_by_ids(&[1, 2, 99]).unwrap();
        assert_eq!(feeds.len(), 2);
    }
}
