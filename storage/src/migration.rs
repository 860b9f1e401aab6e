//! One-shot hash migration and duplicate repair.
//!
//! Legacy databases identified entries by `(feed_id, url)`. This migration
//! introduces the content hash: it adds the column where absent, drops the
//! old unique index, backfills hashes, collapses rows that hash identically,
//! and only then installs the `(feed_id, hash)` unique index. Re-running on
//! a migrated database changes nothing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use rill_types::entry_hash;

use crate::{Result, ai_cache::AiArtifactKind};

pub(crate) fn run(conn: &mut Connection) -> Result<()> {
    if !has_column(conn, "entries", "hash")? {
        conn.execute(
            "ALTER TABLE entries ADD COLUMN hash TEXT NOT NULL DEFAULT ''",
            [],
        )?;
        tracing::info!("added entries.hash column");
    }

    for index in legacy_url_indexes(conn)? {
        conn.execute(&format!("DROP INDEX {index}"), [])?;
        tracing::info!(index = %index, "dropped legacy feed/url unique index");
    }

    repair(conn)?;

    // Only safe once duplicates are gone.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_entries_feed_hash ON entries(feed_id, hash)",
        [],
    )?;
    Ok(())
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Explicitly created unique indexes over exactly `(feed_id, url)`.
fn legacy_url_indexes(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA index_list(entries)")?;
    let indexes = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut legacy = Vec::new();
    for index in indexes {
        let (name, unique, origin) = index?;
        if unique == 0 || origin != "c" {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info({name})"))?;
        let columns = info
            .query_map([], |row| row.get::<_, String>(2))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        if columns == ["feed_id", "url"] {
            legacy.push(name);
        }
    }
    Ok(legacy)
}

struct Row {
    id: i64,
    feed_id: i64,
    hash: String,
    url: Option<String>,
    title: Option<String>,
    content: Option<String>,
    read: bool,
    starred: bool,
    updated_at: DateTime<Utc>,
}

/// Backfill hashes and collapse duplicates inside one transaction.
fn repair(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;

    let mut rows = Vec::new();
    {
        let mut stmt = tx.prepare(
            "SELECT id, feed_id, hash, url, title, content, read, starred, updated_at \
             FROM entries",
        )?;
        let mapped = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        for row in mapped {
            let (id, feed_id, hash, url, title, content, read, starred, updated_at) = row?;
            rows.push(Row {
                id,
                feed_id,
                hash,
                url,
                title,
                content,
                read: read != 0,
                starred: starred != 0,
                updated_at: rill_types::parse_time(&updated_at)
                    .unwrap_or(chrono::DateTime::UNIX_EPOCH),
            });
        }
    }

    // Rows that already carry a hash keep it; everything else gets the
    // canonical fingerprint. Recomputing would be a no-op, keeping it makes
    // the idempotence obvious.
    let mut groups: HashMap<(i64, String), Vec<usize>> = HashMap::new();
    for (idx, row) in rows.iter().enumerate() {
        let hash = if row.hash.is_empty() {
            entry_hash(
                row.url.as_deref().unwrap_or(""),
                row.title.as_deref().unwrap_or(""),
                row.content.as_deref().unwrap_or(""),
                row.id,
            )
        } else {
            row.hash.clone()
        };
        groups.entry((row.feed_id, hash)).or_default().push(idx);
    }

    for ((_, hash), indexes) in &groups {
        if indexes.len() == 1 {
            let idx = indexes[0];
            if rows[idx].hash != *hash {
                tx.execute(
                    "UPDATE entries SET hash = ?2 WHERE id = ?1",
                    params![rows[idx].id, hash],
                )?;
            }
            continue;
        }

        // Survivor: latest updated_at, then highest id.
        let survivor_idx = *indexes
            .iter()
            .max_by(|a, b| {
                rows[**a]
                    .updated_at
                    .cmp(&rows[**b].updated_at)
                    .then(rows[**a].id.cmp(&rows[**b].id))
            })
            .expect("non-empty group");
        let survivor = &rows[survivor_idx];

        let read = indexes.iter().any(|i| rows[*i].read);
        let starred = indexes.iter().any(|i| rows[*i].starred);

        for &idx in indexes {
            if idx == survivor_idx {
                continue;
            }
            let loser = &rows[idx];
            for kind in [
                AiArtifactKind::Summary,
                AiArtifactKind::Translation,
                AiArtifactKind::ListTranslation,
            ] {
                // Move artifacts to the survivor; on key conflict the
                // survivor's own artifact wins and the loser's is dropped.
                tx.execute(
                    &format!(
                        "UPDATE OR IGNORE {} SET entry_id = ?1 WHERE entry_id = ?2",
                        kind.table()
                    ),
                    params![survivor.id, loser.id],
                )?;
                tx.execute(
                    &format!("DELETE FROM {} WHERE entry_id = ?1", kind.table()),
                    params![loser.id],
                )?;
            }
            tx.execute("DELETE FROM entries WHERE id = ?1", params![loser.id])?;
            tracing::debug!(
                loser = loser.id,
                survivor = survivor.id,
                "collapsed duplicate entry"
            );
        }

        tx.execute(
            "UPDATE entries SET hash = ?2, read = ?3, starred = ?4 WHERE id = ?1",
            params![survivor.id, hash, i64::from(read), i64::from(starred)],
        )?;
    }

    tx.commit()?;
    Ok(())
}
