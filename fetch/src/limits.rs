//! Cached view of the per-host rate-limit table.
//!
//! `get_interval` sits on the hot path (once per outbound fetch), so the
//! whole table is held in memory and reloaded after any write.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rill_storage::{Store, StoreError};
use rill_types::DomainRateLimit;

use crate::host::normalize_host;

pub struct RateLimits {
    store: Arc<Store>,
    cache: RwLock<Option<HashMap<String, u64>>>,
}

impl RateLimits {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: RwLock::new(None),
        }
    }

    /// Minimum interval for a host in seconds; 0 when unconfigured. Storage
    /// failures degrade to "no interval" rather than blocking a refresh.
    pub fn interval_seconds(&self, host: &str) -> u64 {
        let host = normalize_host(host);
        if let Some(cache) = self
            .cache
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
        {
            return cache.get(&host).copied().unwrap_or(0);
        }

        let table = match self.store.list_domain_intervals() {
            Ok(limits) => limits
                .into_iter()
                .map(|l| (normalize_host(&l.host), l.interval_seconds))
                .collect::<HashMap<_, _>>(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to load domain rate limits");
                return 0;
            }
        };
        let interval = table.get(&host).copied().unwrap_or(0);
        *self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(table);
        interval
    }

    pub fn set_interval(&self, host: &str, interval_seconds: i64) -> Result<(), StoreError> {
        self.store.set_domain_interval(host, interval_seconds)?;
        self.invalidate();
        Ok(())
    }

    pub fn delete_interval(&self, host: &str) -> Result<(), StoreError> {
        self.store.delete_domain_interval(host)?;
        self.invalidate();
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<DomainRateLimit>, StoreError> {
        self.store.list_domain_intervals()
    }

    fn invalidate(&self) {
        *self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_invalidate_the_cache() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limits = RateLimits::new(store);

        assert_eq!(limits.interval_seconds("example.com"), 0);

        limits.set_interval("example.com", 5).unwrap();
        assert_eq!(limits.interval_seconds("example.com"), 5);

        limits.delete_interval("example.com").unwrap();
        assert_eq!(limits.interval_seconds("example.com"), 0);
    }

    #[test]
    fn invalid_host_propagates() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limits = RateLimits::new(store);
        assert!(matches!(
            limits.set_interval("bad_host", 10),
            Err(StoreError::Invalid(_))
        ));
    }

    #[test]
    fn lookup_normalizes_host() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limits = RateLimits::new(store);
        limits.set_interval("example.com", 7).unwrap();
        assert_eq!(limits.interval_seconds("Example.COM."), 7);
    }
}
