//! Host-aware refresh scheduling.
//!
//! Three bounds apply to a refresh batch: at most 8 fetches in flight
//! globally, strictly one request at a time per host, and a configurable
//! minimum interval between request starts to one host.
//!
//! Acquisition order matters. A worker takes its host permit first, sleeps
//! out the host interval, and only then competes for a global slot. Taking
//! the global slot first would let N feeds on one host occupy the whole pool
//! while queueing on that host's permit, starving every other host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use rill_types::Feed;

use crate::host::host_of;
use crate::limits::RateLimits;

/// Upper bound on concurrently in-flight fetches.
pub const GLOBAL_CONCURRENCY: usize = 8;

pub struct HostScheduler {
    global: Arc<Semaphore>,
    limits: Arc<RateLimits>,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
    last_starts: Mutex<HashMap<String, Instant>>,
}

impl HostScheduler {
    #[must_use]
    pub fn new(limits: Arc<RateLimits>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(GLOBAL_CONCURRENCY)),
            limits,
            hosts: Mutex::new(HashMap::new()),
            last_starts: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh a batch of feeds, one task per feed, returning once every
    /// task has finished or bailed out on cancellation.
    pub async fn run<F, Fut>(self: Arc<Self>, feeds: Vec<Feed>, cancel: &CancellationToken, fetch: F)
    where
        F: Fn(Feed, CancellationToken) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for feed in feeds {
            let scheduler = Arc::clone(&self);
            let cancel = cancel.clone();
            let fetch = fetch.clone();
            tasks.spawn(async move {
                scheduler.run_one(feed, cancel, fetch).await;
            });
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(err) = result {
                tracing::warn!(error = %err, "refresh worker panicked");
            }
        }
    }

    async fn run_one<F, Fut>(&self, feed: Feed, cancel: CancellationToken, fetch: F)
    where
        F: Fn(Feed, CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        // Unparseable URLs skip host gating; the fetcher records the error.
        let host = host_of(&feed.url).unwrap_or_default();

        let host_permit = {
            let semaphore = self.host_semaphore(&host);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(feed = feed.id, host = %host, "cancelled waiting for host permit");
                    return;
                }
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            }
        };

        if !self.wait_host_interval(&host, &cancel).await {
            tracing::debug!(feed = feed.id, host = %host, "cancelled waiting for host interval");
            return;
        }

        let global_permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(feed = feed.id, host = %host, "cancelled waiting for global slot");
                return;
            }
            permit = Arc::clone(&self.global).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };

        self.record_start(&host);
        fetch(feed, cancel).await;

        drop(global_permit);
        drop(host_permit);
    }

    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut hosts = self
            .hosts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(
            hosts
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1))),
        )
    }

    /// Sleep until the host's minimum interval since the last request start
    /// has elapsed. Returns `false` on cancellation.
    async fn wait_host_interval(&self, host: &str, cancel: &CancellationToken) -> bool {
        let interval = self.limits.interval_seconds(host);
        if interval == 0 {
            return true;
        }

        let deadline = {
            let last_starts = self
                .last_starts
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            last_starts
                .get(host)
                .map(|last| *last + Duration::from_secs(interval))
        };

        let Some(deadline) = deadline else {
            return true;
        };
        if deadline <= Instant::now() {
            return true;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            () = tokio::time::sleep_until(deadline) => true,
        }
    }

    fn record_start(&self, host: &str) {
        self.last_starts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(host.to_string(), Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_storage::Store;
    use rill_types::FeedKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn feed(id: i64, url: &str) -> Feed {
        let now = rill_types::now();
        Feed {
            id,
            url: url.to_string(),
            title: format!("feed {id}"),
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

    fn scheduler_with_interval(host: &str, seconds: i64) -> Arc<HostScheduler> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let limits = Arc::new(RateLimits::new(store));
        if seconds > 0 {
            limits.set_interval(host, seconds).unwrap();
        }
        Arc::new(HostScheduler::new(limits))
    }

    #[tokio::test(start_paused = true)]
    async fn same_host_requests_are_spaced_by_interval() {
        let scheduler = scheduler_with_interval("slow.example", 1);
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

        let feeds = vec![
            feed(1, "https://slow.example/a.xml"),
            feed(2, "https://slow.example/b.xml"),
            feed(3, "https://slow.example/c.xml"),
        ];
        let cancel = CancellationToken::new();
        let begin = Instant::now();

        let starts_clone = Arc::clone(&starts);
        scheduler
            .run(feeds, &cancel, move |_, _| {
                let starts = Arc::clone(&starts_clone);
                async move {
                    starts.lock().unwrap().push(Instant::now());
                }
            })
            .await;

        let mut recorded = starts.lock().unwrap().clone();
        recorded.sort();
        assert_eq!(recorded.len(), 3);
        assert!(recorded[1] - recorded[0] >= Duration::from_secs(1));
        assert!(recorded[2] - recorded[1] >= Duration::from_secs(1));
        assert!(recorded[2] - begin >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn other_hosts_start_immediately() {
        let scheduler = scheduler_with_interval("slow.example", 5);
        let starts: Arc<Mutex<Vec<(i64, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

        let feeds = vec![
            feed(1, "https://slow.example/a.xml"),
            feed(2, "https://slow.example/b.xml"),
            feed(3, "https://other-host.example/c.xml"),
        ];
        let cancel = CancellationToken::new();
        let begin = Instant::now();

        let starts_clone = Arc::clone(&starts);
        scheduler
            .run(feeds, &cancel, move |f, _| {
                let starts = Arc::clone(&starts_clone);
                async move {
                    starts.lock().unwrap().push((f.id, Instant::now()));
                }
            })
            .await;

        let recorded = starts.lock().unwrap().clone();
        let other = recorded.iter().find(|(id, _)| *id == 3).unwrap();
        assert!(other.1 - begin < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn global_pool_bounds_in_flight_fetches() {
        let scheduler = scheduler_with_interval("unused.example", 0);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let feeds: Vec<Feed> = (0..32)
            .map(|i| feed(i, &format!("https://host-{i}.example/feed.xml")))
            .collect();
        let cancel = CancellationToken::new();

        let in_flight_clone = Arc::clone(&in_flight);
        let peak_clone = Arc::clone(&peak);
        scheduler
            .run(feeds, &cancel, move |_, _| {
                let in_flight = Arc::clone(&in_flight_clone);
                let peak = Arc::clone(&peak_clone);
                async move {
                    let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(current, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .await;

        assert!(peak.load(Ordering::SeqCst) <= GLOBAL_CONCURRENCY);
    }

    #[tokio::test]
    async fn cancellation_skips_pending_fetches() {
        let scheduler = scheduler_with_interval("slow.example", 60);
        let ran = Arc::new(AtomicUsize::new(0));

        let feeds = vec![
            feed(1, "https://slow.example/a.xml"),
            feed(2, "https://slow.example/b.xml"),
        ];
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ran_clone = Arc::clone(&ran);
        scheduler
            .run(feeds, &cancel, move |_, _| {
                let ran = Arc::clone(&ran_clone);
                async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
