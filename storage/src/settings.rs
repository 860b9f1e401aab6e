//! Settings key-value table.
//!
//! Runtime-mutable configuration (fallback user agent, AI language, rate
//! limit) and the Anubis cookie cache live here.

use rusqlite::{OptionalExtension, params};

use crate::{Result, Store};

impl Store {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock().execute(
            "INSERT INTO settings (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<()> {
        self.lock()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(())
    }

    pub fn get_settings_by_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT key, value FROM settings WHERE key LIKE ?1 || '%' ORDER BY key")?;
        let rows = stmt.query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_and_get_by_prefix_filters() {
        let store = Store::open_in_memory().unwrap();
        store.set_setting("ai.summary_language", "zh-CN").unwrap();
        store.set_setting("ai.summary_language", "en").unwrap();
        store.set_setting("ai.rate_limit_rpm", "30").unwrap();
        store.set_setting("fetch.fallback_user_agent", "UA-X").unwrap();

        assert_eq!(
            store.get_setting("ai.summary_language").unwrap().as_deref(),
            Some("en")
        );

        let ai = store.get_settings_by_prefix("ai.").unwrap();
        assert_eq!(ai.len(), 2);

        store.delete_setting("ai.rate_limit_rpm").unwrap();
        assert_eq!(store.get_setting("ai.rate_limit_rpm").unwrap(), None);
    }
}
