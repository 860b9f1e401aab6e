//! Per-host minimum-interval configuration.
//!
//! Read on the hot path before every outbound fetch (the fetch crate keeps a
//! cached view); written rarely. An interval of 0 and an absent row mean the
//! same thing: no minimum.

use rusqlite::{OptionalExtension, params};

use rill_types::DomainRateLimit;

use crate::{Result, Store, StoreError};

/// Syntactic host validation: DNS labels of `[a-z0-9-]` (no leading or
/// trailing hyphen) joined by dots, or an IP literal. Ports, schemes and
/// underscores are rejected.
fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(StoreError::Invalid("host must not be empty".to_string()));
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    let valid_labels = host.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    });
    if !valid_labels {
        return Err(StoreError::Invalid(format!("invalid host: {host}")));
    }
    Ok(())
}

impl Store {
    /// Set (insert or replace) the minimum interval for a host. Negative
    /// values are accepted and stored as 0.
    pub fn set_domain_interval(&self, host: &str, interval_seconds: i64) -> Result<()> {
        validate_host(host)?;
        let interval = interval_seconds.max(0);
        self.lock().execute(
            "INSERT INTO domain_rate_limits (host, interval_seconds) VALUES (?1, ?2) \
             ON CONFLICT(host) DO UPDATE SET interval_seconds = excluded.interval_seconds",
            params![host, interval],
        )?;
        Ok(())
    }

    /// Interval for a host in seconds; 0 when unconfigured.
    pub fn get_domain_interval(&self, host: &str) -> Result<u64> {
        let interval: Option<i64> = self
            .lock()
            .query_row(
                "SELECT interval_seconds FROM domain_rate_limits WHERE host = ?1",
                params![host],
                |row| row.get(0),
            )
            .optional()?;
        Ok(interval.unwrap_or(0).max(0) as u64)
    }

    pub fn delete_domain_interval(&self, host: &str) -> Result<()> {
        self.lock().execute(
            "DELETE FROM domain_rate_limits WHERE host = ?1",
            params![host],
        )?;
        Ok(())
    }

    pub fn list_domain_intervals(&self) -> Result<Vec<DomainRateLimit>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT host, interval_seconds FROM domain_rate_limits ORDER BY host",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DomainRateLimit {
                host: row.get(0)?,
                interval_seconds: row.get::<_, i64>(1)?.max(0) as u64,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_host_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let err = store.set_domain_interval("bad_host", 10).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn negative_interval_stores_as_zero() {
        let store = Store::open_in_memory().unwrap();
        store.set_domain_interval("example.com", -1).unwrap();
        assert_eq!(store.get_domain_interval("example.com").unwrap(), 0);
    }

    #[test]
    fn unconfigured_host_means_no_interval() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_domain_interval("example.com").unwrap(), 0);
    }

    #[test]
    fn set_get_delete_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.set_domain_interval("example.com", 5).unwrap();
        assert_eq!(store.get_domain_interval("example.com").unwrap(), 5);

        store.set_domain_interval("example.com", 9).unwrap();
        assert_eq!(store.get_domain_interval("example.com").unwrap(), 9);

        let listed = store.list_domain_intervals().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].interval_seconds, 9);

        store.delete_domain_interval("example.com").unwrap();
        assert_eq!(store.get_domain_interval("example.com").unwrap(), 0);
    }

    #[test]
    fn ip_literals_are_valid_hosts() {
        let store = Store::open_in_memory().unwrap();
        store.set_domain_interval("192.168.1.10", 3).unwrap();
        store.set_domain_interval("2001:db8::1", 3).unwrap();
    }
}
