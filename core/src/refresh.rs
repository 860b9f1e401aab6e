//! The refresh controller.
//!
//! `refresh_all` is single-flight: a second caller while one batch runs gets
//! `Error::AlreadyRefreshing` instead of a second pass over every feed.
//! Targeted refreshes of individual feeds skip the flight check; they ride
//! the same scheduler, which still enforces the host bounds.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use rill_fetch::{FeedFetcher, HostScheduler};
use rill_storage::Store;
use rill_types::{Error, Feed, Result};

#[derive(Default)]
struct RefreshState {
    is_refreshing: bool,
    last_refreshed_at: Option<DateTime<Utc>>,
}

pub struct RefreshController {
    store: Arc<Store>,
    scheduler: Arc<HostScheduler>,
    fetcher: Arc<FeedFetcher>,
    state: Mutex<RefreshState>,
}

impl RefreshController {
    #[must_use]
    pub fn new(store: Arc<Store>, scheduler: Arc<HostScheduler>, fetcher: Arc<FeedFetcher>) -> Self {
        Self {
            store,
            scheduler,
            fetcher,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Refresh every feed. Single-flight: concurrent calls fail fast.
    pub async fn refresh_all(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.is_refreshing {
                return Err(Error::AlreadyRefreshing);
            }
            state.is_refreshing = true;
        }
        let _flight = FlightGuard { controller: self };

        let feeds = self.store.list_feeds(None)?;
        let count = feeds.len();
        tracing::info!(feeds = count, "refresh started");

        self.run_batch(feeds, cancel).await;

        if !cancel.is_cancelled() {
            self.lock_state().last_refreshed_at = Some(rill_types::now());
            tracing::info!(feeds = count, "refresh finished");
        } else {
            tracing::info!("refresh cancelled");
        }
        Ok(())
    }

    /// Refresh one feed, no flight check.
    pub async fn refresh_feed(&self, id: i64, cancel: &CancellationToken) -> Result<()> {
        self.refresh_feeds(&[id], cancel).await
    }

    /// Refresh a batch of feeds by ID, no flight check.
    pub async fn refresh_feeds(&self, ids: &[i64], cancel: &CancellationToken) -> Result<()> {
        let feeds = self.store.get_feeds_by_ids(ids)?;
        if feeds.is_empty() {
            return Err(Error::NotFound);
        }
        self.run_batch(feeds, cancel).await;
        Ok(())
    }

    #[must_use]
    pub fn last_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().last_refreshed_at
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.lock_state().is_refreshing
    }

    async fn run_batch(&self, feeds: Vec<Feed>, cancel: &CancellationToken) {
        let fetcher = Arc::clone(&self.fetcher);
        Arc::clone(&self.scheduler)
            .run(feeds, cancel, move |feed, cancel| {
                let fetcher = Arc::clone(&fetcher);
                async move {
                    // Per-feed failures are recorded on the feed row; they
                    // never abort the batch.
                    if let Err(err) = fetcher.refresh(&feed, &cancel).await {
                        tracing::debug!(feed = feed.id, error = %err, "feed refresh failed");
                    }
                }
            })
            .await;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Clears the single-flight flag however the refresh ends.
struct FlightGuard<'a> {
    controller: &'a RefreshController,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.controller.lock_state().is_refreshing = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_fetch::{AnubisSolver, ClientConfig, ClientFactory, RateLimits};
    use rill_types::FeedKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss() -> &'static str {
        "<?xml version=\"1.0\"?><rss version=\"2.0\"><channel><title>T</title>\
         <link>https://site.example/</link><item><title>A</title>\
         <link>https://site.example/a</link></item></channel></rss>"
    }

    fn controller_for(store: &Arc<Store>) -> Arc<RefreshController> {
        let factory = ClientFactory::new(ClientConfig::default());
        let solver = Arc::new(AnubisSolver::new(Arc::clone(store)));
        let fetcher = Arc::new(FeedFetcher::new(
            Arc::clone(store),
            factory,
            solver,
            rill_fetch::DEFAULT_USER_AGENT.to_string(),
            None,
        ));
        let limits = Arc::new(RateLimits::new(Arc::clone(store)));
        let scheduler = Arc::new(HostScheduler::new(limits));
        Arc::new(RefreshController::new(Arc::clone(store), scheduler, fetcher))
    }

    fn add_feed(store: &Store, id: i64, url: &str) {
        let now = rill_types::now();
        store
            .create_feed(&Feed {
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
            })
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_all_is_single_flight() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow.xml"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(rss())
                    .set_delay(std::time::Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let store = Arc::new(Store::open_in_memory().unwrap());
        add_feed(&store, 1, &format!("{}/slow.xml", server.uri()));
        let controller = controller_for(&store);

        let cancel = CancellationToken::new();
        let background = {
            let controller = Arc::clone(&controller);
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.refresh_all(&cancel).await })
        };

        // Give the background refresh time to take the flag.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(matches!(
            controller.refresh_all(&cancel).await,
            Err(Error::AlreadyRefreshing)
        ));

        background.await.unwrap().unwrap();
        assert!(!controller.is_refreshing());
        assert!(controller.last_refreshed_at().is_some());

        // The flag is clear again: a new refresh may start.
        controller.refresh_all(&cancel).await.unwrap();
    }

    #[tokio::test]
    async fn refresh_feeds_requires_known_ids() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let controller = controller_for(&store);
        assert!(matches!(
            controller
                .refresh_feeds(&[42], &CancellationToken::new())
                .await,
            Err(Error::NotFound)
        ));
    }

    #[tokio::test]
    async fn one_bad_feed_does_not_abort_the_batch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(rss()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad.xml"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = Arc::new(Store::open_in_memory().unwrap());
        add_feed(&store, 1, &format!("{}/bad.xml", server.uri()));
        add_feed(&store, 2, &format!("{}/good.xml", server.uri()));
        let controller = controller_for(&store);

        controller
            .refresh_all(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            store.get_feed(1).unwrap().error_message.as_deref(),
            Some("HTTP 500")
        );
        assert_eq!(store.get_feed(2).unwrap().error_message, None);
        assert_eq!(
            store
                .list_entries(&rill_types::EntryFilter::default())
                .unwrap()
                .len(),
            1
        );
    }
}
