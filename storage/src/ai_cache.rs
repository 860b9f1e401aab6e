//! AI artifact caches: summaries, translations, list translations.
//!
//! Each artifact is keyed by `(entry_id, readability, language)` and unique
//! on that key. The migration moves artifacts between entries with
//! insert-or-ignore semantics so the survivor's artifact wins on conflict.

use rusqlite::{OptionalExtension, params};

use crate::{Result, Store, StoreError, store_time};

/// Which artifact table an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiArtifactKind {
    Summary,
    Translation,
    ListTranslation,
}

impl AiArtifactKind {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Summary => "ai_summaries",
            Self::Translation => "ai_translations",
            Self::ListTranslation => "ai_list_translations",
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Summary => "summaries",
            Self::Translation => "translations",
            Self::ListTranslation => "list translations",
        }
    }
}

/// Rows removed by a cache clear, reported per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheClearCounts {
    pub summaries: u64,
    pub translations: u64,
    pub list_translations: u64,
}

impl Store {
    pub fn get_ai_artifact(
        &self,
        kind: AiArtifactKind,
        entry_id: i64,
        readability: bool,
        language: &str,
    ) -> Result<Option<String>> {
        Ok(self
            .lock()
            .query_row(
                &format!(
                    "SELECT content FROM {} WHERE entry_id = ?1 AND readability = ?2 \
                     AND language = ?3",
                    kind.table()
                ),
                params![entry_id, i64::from(readability), language],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn put_ai_artifact(
        &self,
        kind: AiArtifactKind,
        entry_id: i64,
        readability: bool,
        language: &str,
        content: &str,
    ) -> Result<()> {
        self.lock().execute(
            &format!(
                "INSERT INTO {} (entry_id, readability, language, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(entry_id, readability, language) DO UPDATE SET \
                 content = excluded.content, created_at = excluded.created_at",
                kind.table()
            ),
            params![
                entry_id,
                i64::from(readability),
                language,
                content,
                store_time(rill_types::now()),
            ],
        )?;
        Ok(())
    }

    /// Clear all three caches. Runs in order (summaries, translations, list
    /// translations) and stops at the first failure, labelling it.
    pub fn clear_ai_caches(&self) -> Result<CacheClearCounts> {
        let summaries = self.clear_one_cache(AiArtifactKind::Summary)?;
        let translations = self.clear_one_cache(AiArtifactKind::Translation)?;
        let list_translations = self.clear_one_cache(AiArtifactKind::ListTranslation)?;
        Ok(CacheClearCounts {
            summaries,
            translations,
            list_translations,
        })
    }

    fn clear_one_cache(&self, kind: AiArtifactKind) -> Result<u64> {
        let changed = self
            .lock()
            .execute(&format!("DELETE FROM {}", kind.table()), [])
            .map_err(|e| {
                StoreError::Invalid(format!("clearing {} cache: {e}", kind.label()))
            })?;
        Ok(changed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewEntry;
    use rill_types::{Feed, FeedKind};

    fn store_with_entry(entry_id: i64) -> Store {
        let store = Store::open_in_memory().unwrap();
        let now = rill_types::now();
        store
            .create_feed(&Feed {
                id: 1,
                url: "https://example.com/feed.xml".to_string(),
                title: "Feed".to_string(),
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
            .create_or_update_entry(&NewEntry {
                id: entry_id,
                feed_id: 1,
                hash: rill_types::entry_hash("https://example.com/a", "", "", entry_id),
                title: None,
                url: Some("https://example.com/a".to_string()),
                content: None,
                thumbnail_url: None,
                author: None,
                published_at: None,
            })
            .unwrap();
        store
    }

    #[test]
    fn artifact_round_trip_and_overwrite() {
        let store = store_with_entry(100);
        store
            .put_ai_artifact(AiArtifactKind::Summary, 100, false, "zh-CN", "first")
            .unwrap();
        store
            .put_ai_artifact(AiArtifactKind::Summary, 100, false, "zh-CN", "second")
            .unwrap();

        assert_eq!(
            store
                .get_ai_artifact(AiArtifactKind::Summary, 100, false, "zh-CN")
                .unwrap()
                .as_deref(),
            Some("second")
        );
        assert_eq!(
            store
                .get_ai_artifact(AiArtifactKind::Summary, 100, true, "zh-CN")
                .unwrap(),
            None
        );
    }

    #[test]
    fn clear_reports_counts_per_table() {
        let store = store_with_entry(100);
        store
            .put_ai_artifact(AiArtifactKind::Summary, 100, false, "zh-CN", "s")
            .unwrap();
        store
            .put_ai_artifact(AiArtifactKind::Translation, 100, false, "zh-CN", "t")
            .unwrap();
        store
            .put_ai_artifact(AiArtifactKind::Translation, 100, true, "zh-CN", "t2")
            .unwrap();

        let counts = store.clear_ai_caches().unwrap();
        assert_eq!(counts.summaries, 1);
        assert_eq!(counts.translations, 2);
        assert_eq!(counts.list_translations, 0);
    }
}
