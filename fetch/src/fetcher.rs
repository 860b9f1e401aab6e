//! The per-feed fetch flow: conditional GET, fallback user agent, the
//! Anubis retry ladder, and entry persistence.
//!
//! Fetching is best-effort by design. Transport and HTTP failures are
//! recorded on the feed row and reported as success so one broken upstream
//! never aborts a refresh batch; only parse failures, rejections and retry
//! exhaustion surface as errors. A cancelled fetch persists nothing.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use rill_storage::{NewEntry, Store};
use rill_types::{Feed, entry_hash, next_id, settings_keys};

use crate::anubis::{AnubisSolver, Detection};
use crate::client::ClientFactory;
use crate::icons;
use crate::{FetchError, Result};

pub struct FeedFetcher {
    store: Arc<Store>,
    factory: ClientFactory,
    solver: Arc<AnubisSolver>,
    user_agent: String,
    /// Directory icons are cached under; `None` disables icon backfill.
    icon_dir: Option<PathBuf>,
}

impl FeedFetcher {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        factory: ClientFactory,
        solver: Arc<AnubisSolver>,
        user_agent: String,
        icon_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            store,
            factory,
            solver,
            user_agent,
            icon_dir,
        }
    }

    /// Refresh one feed. Follows the best-effort contract described on the
    /// module: `Ok(())` covers both success and recorded upstream failures.
    pub async fn refresh(&self, feed: &Feed, cancel: &CancellationToken) -> Result<()> {
        let user_agent = self.user_agent.clone();
        self.fetch_once(feed, None, true, &user_agent, 0, cancel)
            .await
    }

    async fn fetch_once(
        &self,
        feed: &Feed,
        cookie_override: Option<String>,
        allow_fallback: bool,
        user_agent: &str,
        retry_count: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = match Url::parse(&feed.url) {
            Ok(url) => url,
            Err(_) => {
                self.record_error(feed.id, "invalid feed url");
                return Err(FetchError::InvalidUrl(feed.url.clone()));
            }
        };

        // The request's header profile; the cookie cache and the challenge
        // submission both fingerprint exactly what went on the wire.
        let profile = vec![("user-agent".to_string(), user_agent.to_string())];
        let cookie = cookie_override.clone().or_else(|| {
            url.host_str()
                .and_then(|host| self.solver.cached_cookie(host, &profile))
        });

        let feed_url = feed.url.clone();
        let etag = feed.etag.clone();
        let last_modified = feed.last_modified.clone();
        let ua = user_agent.to_string();
        let send = self.factory.dispatch(move |client| {
            let mut request = client.get(&feed_url).header("user-agent", &ua);
            if let Some(cookie) = &cookie {
                request = request.header("cookie", cookie);
            }
            if let Some(etag) = &etag {
                request = request.header("if-none-match", etag);
            }
            if let Some(last_modified) = &last_modified {
                request = request.header("if-modified-since", last_modified);
            }
            request
        });

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = send => match response {
                Ok(response) => response,
                Err(err) => {
                    self.record_error(feed.id, &err.to_string());
                    return Ok(());
                }
            },
        };

        let status = response.status().as_u16();
        if status == 304 {
            tracing::debug!(feed = feed.id, "not modified");
            self.clear_error(feed.id);
            return Ok(());
        }

        if status >= 400 {
            if allow_fallback
                && let Some(fallback) = self.fallback_user_agent()
            {
                tracing::debug!(feed = feed.id, status, "retrying with fallback user agent");
                return Box::pin(self.fetch_once(
                    feed,
                    cookie_override,
                    false,
                    &fallback,
                    retry_count,
                    cancel,
                ))
                .await;
            }
            self.record_error(feed.id, &format!("HTTP {status}"));
            return Ok(());
        }

        let response_etag = header_string(&response, "etag");
        let response_last_modified = header_string(&response, "last-modified");
        let set_cookies: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|raw| raw.split(';').next())
            .map(|pair| pair.trim().to_string())
            .collect();

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            body = response.text() => match body {
                Ok(body) => body,
                Err(err) => {
                    self.record_error(feed.id, &err.to_string());
                    return Ok(());
                }
            },
        };

        match feed_rs::parser::parse(body.as_bytes()) {
            Ok(parsed) => {
                self.persist_feed_update(feed, &parsed, response_etag, response_last_modified, cancel)
                    .await;
                Ok(())
            }
            Err(parse_err) => {
                self.handle_unparseable(
                    feed,
                    &url,
                    &body,
                    &parse_err.to_string(),
                    &set_cookies,
                    &profile,
                    allow_fallback,
                    user_agent,
                    retry_count,
                    cancel,
                )
                .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_unparseable(
        &self,
        feed: &Feed,
        url: &Url,
        body: &str,
        parse_error: &str,
        set_cookies: &[String],
        profile: &[(String, String)],
        allow_fallback: bool,
        user_agent: &str,
        retry_count: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match crate::anubis::detect(body) {
            Detection::NotAnubis => {
                self.record_error(feed.id, &format!("parse error: {parse_error}"));
                Err(FetchError::Parse(parse_error.to_string()))
            }
            Detection::Rejected => {
                self.record_error(feed.id, "upstream rejected");
                Err(FetchError::UpstreamRejected)
            }
            Detection::Challenge(challenge) => {
                if retry_count >= 2 {
                    self.record_error(feed.id, "retry limit exceeded");
                    return Err(FetchError::RetryExceeded);
                }

                let cookie = match self
                    .solver
                    .obtain(url, &challenge, set_cookies, profile, &self.factory, cancel)
                    .await
                {
                    Ok(cookie) => cookie,
                    Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                    Err(err) => {
                        self.record_error(feed.id, &err.to_string());
                        return Err(err);
                    }
                };

                tracing::debug!(feed = feed.id, retry = retry_count + 1, "retrying with challenge cookie");
                Box::pin(self.fetch_once(
                    feed,
                    Some(cookie),
                    allow_fallback,
                    user_agent,
                    retry_count + 1,
                    cancel,
                ))
                .await
            }
        }
    }

    /// A successful parse: write entries sequentially, refresh validators,
    /// clear the error, backfill site URL and icon.
    async fn persist_feed_update(
        &self,
        feed: &Feed,
        parsed: &feed_rs::model::Feed,
        response_etag: Option<String>,
        response_last_modified: Option<String>,
        cancel: &CancellationToken,
    ) {
        for item in &parsed.entries {
            let entry = map_entry(feed.id, item);
            let exists = match self.store.entry_exists_by_hash(feed.id, &entry.hash) {
                Ok(exists) => exists,
                Err(err) => {
                    tracing::warn!(feed = feed.id, error = %err, "entry lookup failed");
                    continue;
                }
            };

            if !exists
                && let Some(entry_url) = &entry.url
            {
                match self
                    .store
                    .entry_exists_by_legacy_url(feed.id, entry_url, &entry.hash)
                {
                    Ok(true) => {
                        if let Err(err) =
                            self.store.adopt_legacy_entry(feed.id, entry_url, &entry.hash)
                        {
                            tracing::warn!(feed = feed.id, error = %err, "legacy backfill failed");
                        }
                    }
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(feed = feed.id, error = %err, "legacy lookup failed");
                    }
                }
            }

            if let Err(err) = self.store.create_or_update_entry(&entry) {
                tracing::warn!(feed = feed.id, error = %err, "entry upsert failed");
            }
        }

        // Validators: take what the response offered, keep the rest. They
        // are only ever cleared by an explicit cache reset.
        let new_etag = response_etag.or_else(|| feed.etag.clone());
        let new_last_modified = response_last_modified.or_else(|| feed.last_modified.clone());
        if new_etag != feed.etag || new_last_modified != feed.last_modified {
            if let Err(err) = self.store.update_feed_conditional_get(
                feed.id,
                new_etag.as_deref(),
                new_last_modified.as_deref(),
            ) {
                tracing::warn!(feed = feed.id, error = %err, "conditional-get update failed");
            }
        }

        self.clear_error(feed.id);

        let site_url = site_url_of(parsed, &feed.url);
        if feed.site_url.as_deref().unwrap_or("").is_empty()
            && let Some(site_url) = &site_url
        {
            if let Err(err) = self.store.update_feed_site_url(feed.id, site_url) {
                tracing::warn!(feed = feed.id, error = %err, "site url backfill failed");
            }
        }

        if feed.icon_path.as_deref().unwrap_or("").is_empty()
            && let Some(icon_dir) = &self.icon_dir
        {
            let base = site_url.as_deref().unwrap_or(&feed.url);
            icons::backfill(&self.store, &self.factory, feed.id, base, icon_dir, cancel).await;
        }
    }

    fn fallback_user_agent(&self) -> Option<String> {
        match self.store.get_setting(settings_keys::FALLBACK_USER_AGENT) {
            Ok(value) => value.filter(|ua| !ua.trim().is_empty()),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read fallback user agent");
                None
            }
        }
    }

    fn record_error(&self, feed_id: i64, message: &str) {
        if let Err(err) = self.store.update_feed_error_message(feed_id, Some(message)) {
            tracing::warn!(feed = feed_id, error = %err, "failed to record feed error");
        }
    }

    fn clear_error(&self, feed_id: i64) {
        if let Err(err) = self.store.update_feed_error_message(feed_id, None) {
            tracing::warn!(feed = feed_id, error = %err, "failed to clear feed error");
        }
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string)
}

/// First thumbnail-ish image: declared media thumbnails win, then the first
/// `<img>` in the content HTML.
fn thumbnail_of(item: &feed_rs::model::Entry, content: Option<&str>) -> Option<String> {
    for media in &item.media {
        if let Some(thumbnail) = media.thumbnails.first() {
            return Some(thumbnail.image.uri.clone());
        }
    }

    let content = content?;
    let re = regex::Regex::new(r#"<img[^>]+src\s*=\s*["']([^"']+)["']"#).ok()?;
    re.captures(content)
        .map(|captures| captures[1].to_string())
        .filter(|src| !src.starts_with("data:"))
}

fn map_entry(feed_id: i64, item: &feed_rs::model::Entry) -> NewEntry {
    let title = item.title.as_ref().map(|t| t.content.clone());
    let url = item.links.first().map(|link| link.href.clone());
    let content = item
        .content
        .as_ref()
        .and_then(|c| c.body.clone())
        .or_else(|| item.summary.as_ref().map(|s| s.content.clone()));
    let thumbnail_url = thumbnail_of(item, content.as_deref());
    let author = item
        .authors
        .first()
        .map(|person| person.name.clone())
        .filter(|name| !name.is_empty());
    let published_at = item.published.or(item.updated);

    let id = next_id();
    let hash = entry_hash(
        url.as_deref().unwrap_or(""),
        title.as_deref().unwrap_or(""),
        content.as_deref().unwrap_or(""),
        id,
    );

    NewEntry {
        id,
        feed_id,
        hash,
        title,
        url,
        content,
        thumbnail_url,
        author,
        published_at,
    }
}

/// Site link advertised by the document, skipping the feed's own URL.
fn site_url_of(parsed: &feed_rs::model::Feed, feed_url: &str) -> Option<String> {
    parsed
        .links
        .iter()
        .map(|link| link.href.clone())
        .find(|href| href != feed_url)
}
