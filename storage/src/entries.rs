//! Entry repository operations: hash-keyed upsert, legacy-URL backfill, and
//! filtered listings.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};

use rill_types::{Entry, EntryFilter, UnreadCount};

use crate::{Result, Store, StoreError, read_time, read_time_opt, store_time};

const ENTRY_COLUMNS: &str = "e.id, e.feed_id, e.hash, e.title, e.url, e.content, \
     e.readable_content, e.thumbnail_url, e.author, e.published_at, e.read, e.starred, \
     e.created_at, e.updated_at";

/// Fields the fetcher supplies when persisting a parsed item. Flags and
/// reader content are owned by the user/readability paths and never written
/// here.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub id: i64,
    pub feed_id: i64,
    pub hash: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub content: Option<String>,
    pub thumbnail_url: Option<String>,
    pub author: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

struct RawEntry {
    entry: Entry,
    published_at: Option<String>,
    created_at: String,
    updated_at: String,
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        entry: Entry {
            id: row.get(0)?,
            feed_id: row.get(1)?,
            hash: row.get(2)?,
            title: row.get(3)?,
            url: row.get(4)?,
            content: row.get(5)?,
            readable_content: row.get(6)?,
            thumbnail_url: row.get(7)?,
            author: row.get(8)?,
            published_at: None,
            read: row.get::<_, i64>(10)? != 0,
            starred: row.get::<_, i64>(11)? != 0,
            created_at: chrono::DateTime::UNIX_EPOCH,
            updated_at: chrono::DateTime::UNIX_EPOCH,
        },
        published_at: row.get(9)?,
        created_at: row.get(12)?,
        updated_at: row.get(13)?,
    })
}

fn finish_entry(raw: RawEntry) -> Result<Entry> {
    let mut entry = raw.entry;
    entry.published_at = read_time_opt(raw.published_at)?;
    entry.created_at = read_time(&raw.created_at)?;
    entry.updated_at = read_time(&raw.updated_at)?;
    Ok(entry)
}

impl Store {
    /// Insert the entry, or refresh the mutable columns of the row already
    /// holding `(feed_id, hash)`. `read`, `starred` and `readable_content`
    /// are never touched by the upsert.
    pub fn create_or_update_entry(&self, entry: &NewEntry) -> Result<()> {
        let now = store_time(rill_types::now());
        self.lock().execute(
            "INSERT INTO entries (id, feed_id, hash, title, url, content, thumbnail_url, \
             author, published_at, read, starred, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?10) \
             ON CONFLICT(feed_id, hash) DO UPDATE SET \
             title = excluded.title, url = excluded.url, content = excluded.content, \
             thumbnail_url = excluded.thumbnail_url, author = excluded.author, \
             published_at = excluded.published_at, updated_at = excluded.updated_at",
            params![
                entry.id,
                entry.feed_id,
                entry.hash,
                entry.title,
                entry.url,
                entry.content,
                entry.thumbnail_url,
                entry.author,
                entry.published_at.map(store_time),
                now,
            ],
        )?;
        Ok(())
    }

    pub fn entry_exists_by_hash(&self, feed_id: i64, hash: &str) -> Result<bool> {
        let found: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM entries WHERE feed_id = ?1 AND hash = ?2",
                params![feed_id, hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// A row created before hashing: same feed and URL but a hash this code
    /// would not produce today.
    pub fn entry_exists_by_legacy_url(&self, feed_id: i64, url: &str, hash: &str) -> Result<bool> {
        let found: Option<i64> = self
            .lock()
            .query_row(
                "SELECT 1 FROM entries WHERE feed_id = ?1 AND url = ?2 AND hash <> ?3",
                params![feed_id, url, hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Move a legacy row onto the current hash so the following upsert lands
    /// on it instead of inserting a duplicate. No-op when the target hash is
    /// already taken within the feed.
    pub fn adopt_legacy_entry(&self, feed_id: i64, url: &str, hash: &str) -> Result<u64> {
        let changed = self.lock().execute(
            "UPDATE entries SET hash = ?3, updated_at = ?4 \
             WHERE feed_id = ?1 AND url = ?2 AND hash <> ?3 \
             AND NOT EXISTS (SELECT 1 FROM entries WHERE feed_id = ?1 AND hash = ?3)",
            params![feed_id, url, hash, store_time(rill_types::now())],
        )?;
        Ok(changed as u64)
    }

    pub fn get_entry(&self, id: i64) -> Result<Entry> {
        let raw = self
            .lock()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries e WHERE e.id = ?1"),
                params![id],
                entry_from_row,
            )
            .optional()?
            .ok_or(StoreError::NotFound)?;
        finish_entry(raw)
    }

    /// Filtered listing, newest first. The page size clamps to the filter's
    /// allowed range regardless of what the caller asked for.
    pub fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<Entry>> {
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM entries e JOIN feeds f ON f.id = e.feed_id WHERE 1=1"
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(feed_id) = filter.feed_id {
            sql.push_str(" AND e.feed_id = ?");
            args.push(Box::new(feed_id));
        }
        if let Some(folder_id) = filter.folder_id {
            sql.push_str(" AND f.folder_id = ?");
            args.push(Box::new(folder_id));
        }
        if let Some(kind) = filter.kind {
            sql.push_str(" AND f.kind = ?");
            args.push(Box::new(kind.as_str().to_string()));
        }
        if filter.unread_only {
            sql.push_str(" AND e.read = 0");
        }
        if filter.starred_only {
            sql.push_str(" AND e.starred = 1");
        }
        if filter.has_thumbnail {
            sql.push_str(" AND e.thumbnail_url IS NOT NULL AND e.thumbnail_url <> ''");
        }

        sql.push_str(" ORDER BY COALESCE(e.published_at, e.created_at) DESC, e.id DESC LIMIT ? OFFSET ?");
        args.push(Box::new(i64::from(filter.effective_limit())));
        args.push(Box::new(i64::from(filter.effective_offset())));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(std::convert::AsRef::as_ref)),
            entry_from_row,
        )?;
        let collected = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);
        drop(conn);
        collected.into_iter().map(finish_entry).collect()
    }

    pub fn update_entry_read_status(&self, id: i64, read: bool) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE entries SET read = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, i64::from(read), store_time(rill_types::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_entry_starred_status(&self, id: i64, starred: bool) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE entries SET starred = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, i64::from(starred), store_time(rill_types::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn update_entry_readable_content(&self, id: i64, readable: &str) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE entries SET readable_content = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, readable, store_time(rill_types::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Mark everything matching the optional feed / folder / kind scopes as
    /// read. With no scope at all, everything unread is marked.
    pub fn mark_all_as_read(
        &self,
        feed_id: Option<i64>,
        folder_id: Option<i64>,
        kind: Option<rill_types::FeedKind>,
    ) -> Result<u64> {
        let mut sql = String::from(
            "UPDATE entries SET read = 1, updated_at = ? WHERE read = 0 AND feed_id IN \
             (SELECT id FROM feeds WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(store_time(rill_types::now()))];

        if let Some(feed_id) = feed_id {
            sql.push_str(" AND id = ?");
            args.push(Box::new(feed_id));
        }
        if let Some(folder_id) = folder_id {
            sql.push_str(" AND folder_id = ?");
            args.push(Box::new(folder_id));
        }
        if let Some(kind) = kind {
            sql.push_str(" AND kind = ?");
            args.push(Box::new(kind.as_str().to_string()));
        }
        sql.push(')');

        let changed = self.lock().execute(
            &sql,
            rusqlite::params_from_iter(args.iter().map(std::convert::AsRef::as_ref)),
        )?;
        Ok(changed as u64)
    }

    pub fn get_all_unread_counts(&self) -> Result<Vec<UnreadCount>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT feed_id, COUNT(*) FROM entries WHERE read = 0 GROUP BY feed_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(UnreadCount {
                feed_id: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_starred_count(&self) -> Result<u64> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM entries WHERE starred = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn clear_all_readable_content(&self) -> Result<u64> {
        let changed = self.lock().execute(
            "UPDATE entries SET readable_content = NULL WHERE readable_content IS NOT NULL",
            [],
        )?;
        Ok(changed as u64)
    }

    /// Cache clear for unstarred history.
    pub fn delete_unstarred_entries(&self) -> Result<u64> {
        let changed = self
            .lock()
            .execute("DELETE FROM entries WHERE starred = 0", [])?;
        Ok(changed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_types::{Feed, FeedKind, entry_hash};

    fn store_with_feed(id: i64) -> Store {
        let store = Store::open_in_memory().unwrap();
        let now = rill_types::now();
        store
            .create_feed(&Feed {
                id,
                url: format!("https://example.com/{id}/feed.xml"),
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
            })
            .unwrap();
        store
    }

    fn new_entry(id: i64, feed_id: i64, url: &str) -> NewEntry {
        NewEntry {
            id,
            feed_id,
            hash: entry_hash(url, "", "", id),
            title: Some(format!("Entry {id}")),
            url: Some(url.to_string()),
            content: Some("body".to_string()),
            thumbnail_url: None,
            author: None,
            published_at: None,
        }
    }

    #[test]
    fn upsert_is_idempotent_per_hash() {
        let store = store_with_feed(1);
        let entry = new_entry(100, 1, "https://example.com/post/1");
        store.create_or_update_entry(&entry).unwrap();
        store.create_or_update_entry(&entry).unwrap();

        let listed = store.list_entries(&EntryFilter::default()).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].hash.len(), 64);
    }

    #[test]
    fn upsert_preserves_read_and_starred() {
        let store = store_with_feed(1);
        let mut entry = new_entry(100, 1, "https://example.com/post/1");
        store.create_or_update_entry(&entry).unwrap();
        store.update_entry_read_status(100, true).unwrap();
        store.update_entry_starred_status(100, true).unwrap();

        entry.title = Some("Updated title".to_string());
        store.create_or_update_entry(&entry).unwrap();

        let loaded = store.get_entry(100).unwrap();
        assert!(loaded.read);
        assert!(loaded.starred);
        assert_eq!(loaded.title.as_deref(), Some("Updated title"));
    }

    #[test]
    fn legacy_url_lookup_sees_hash_mismatch_only() {
        let store = store_with_feed(1);
        let mut entry = new_entry(100, 1, "https://example.com/post/1");
        entry.hash = "0".repeat(64);
        store.create_or_update_entry(&entry).unwrap();

        let fresh_hash = entry_hash("https://example.com/post/1", "", "", 0);
        assert!(store
            .entry_exists_by_legacy_url(1, "https://example.com/post/1", &fresh_hash)
            .unwrap());
        assert!(!store
            .entry_exists_by_legacy_url(1, "https://example.com/post/1", &"0".repeat(64))
            .unwrap());

        assert_eq!(
            store
                .adopt_legacy_entry(1, "https://example.com/post/1", &fresh_hash)
                .unwrap(),
            1
        );
        assert!(store.entry_exists_by_hash(1, &fresh_hash).unwrap());
    }

    #[test]
    fn list_filters_compose() {
        let store = store_with_feed(1);
        for i in 0..5 {
            let mut entry = new_entry(100 + i, 1, &format!("https://example.com/post/{i}"));
            if i % 2 == 0 {
                entry.thumbnail_url = Some("https://example.com/thumb.jpg".to_string());
            }
            store.create_or_update_entry(&entry).unwrap();
        }
        store.update_entry_read_status(100, true).unwrap();

        let unread = store
            .list_entries(&EntryFilter {
                unread_only: true,
                ..EntryFilter::default()
            })
            .unwrap();
        assert_eq!(unread.len(), 4);

        let with_thumb = store
            .list_entries(&EntryFilter {
                has_thumbnail: true,
                ..EntryFilter::default()
            })
            .unwrap();
        assert_eq!(with_thumb.len(), 3);
    }

    #[test]
    fn mark_all_as_read_scopes_by_feed() {
        let store = store_with_feed(1);
        let now = rill_types::now();
        store
            .create_feed(&Feed {
                id: 2,
                url: "https://other.example/feed.xml".to_string(),
                title: "Other".to_string(),
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
            })
            .unwrap();

        store
            .create_or_update_entry(&new_entry(100, 1, "https://example.com/a"))
            .unwrap();
        store
            .create_or_update_entry(&new_entry(101, 2, "https://other.example/b"))
            .unwrap();

        assert_eq!(store.mark_all_as_read(Some(1), None, None).unwrap(), 1);
        let counts = store.get_all_unread_counts().unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].feed_id, 2);
    }

    #[test]
    fn delete_unstarred_keeps_starred() {
        let store = store_with_feed(1);
        store
            .create_or_update_entry(&new_entry(100, 1, "https://example.com/a"))
            .unwrap();
        store
            .create_or_update_entry(&new_entry(101, 1, "https://example.com/b"))
            .unwrap();
        store.update_entry_starred_status(101, true).unwrap();

        assert_eq!(store.delete_unstarred_entries().unwrap(), 1);
        assert!(store.get_entry(101).is_ok());
        assert!(matches!(store.get_entry(100), Err(StoreError::NotFound)));
    }
}
