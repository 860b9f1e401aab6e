//! Anubis challenge detection, solving, and cookie caching.
//!
//! Some upstreams front their content with an interactive bot check: an HTML
//! page carrying `<script id="anubis_challenge" type="application/json">`
//! whose JSON describes a puzzle. Solving it and submitting the answer earns
//! an auth cookie; without the cookie the origin serves the same page
//! forever. A `null` challenge is a permanent rejection.
//!
//! Cookies are cached per `(host, header fingerprint)` so one solve serves
//! every later request presenting the same client profile, and concurrent
//! solvers for one cache key collapse into a single flight.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use url::{Position, Url};

use rill_storage::Store;
use rill_types::settings_keys::ANUBIS_COOKIE_PREFIX;

use crate::client::ClientFactory;
use crate::host::normalize_host;
use crate::{FetchError, Result};

/// Path the solved answer is submitted to, on the challenge's origin.
pub const PASS_CHALLENGE_PATH: &str = "/.within.website/x/cmd/anubis/api/pass-challenge";

/// How long a won cookie stays cached.
const COOKIE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Grace period for waiters between the leader's broadcast and the cache
/// re-read, covering storage visibility.
const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Cancellation is polled once per this many proof-of-work iterations.
const POW_CANCEL_STRIDE: u64 = 10_000;

const CHALLENGE_MARKER: &str = "anubis_challenge";

/// Header names hashed into the cookie-cache fingerprint, in order.
const FINGERPRINT_HEADERS: &[&str] = &[
    "user-agent",
    "accept",
    "accept-language",
    "accept-encoding",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "sec-ch-ua-arch",
    "sec-ch-ua-model",
    "sec-ch-ua-platform-version",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-user",
    "upgrade-insecure-requests",
    "priority",
];

/// Header names replayed on the submission request, in order.
const SUBMISSION_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "accept-encoding",
    "cache-control",
    "pragma",
    "priority",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-platform",
    "sec-ch-ua-arch",
    "sec-ch-ua-model",
    "sec-ch-ua-platform-version",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "sec-fetch-user",
    "upgrade-insecure-requests",
    "referer",
    "user-agent",
];

/// What a response body turned out to be.
#[derive(Debug)]
pub enum Detection {
    /// Not an Anubis page at all.
    NotAnubis,
    /// Anubis page with a `null` challenge: the origin will never serve us.
    Rejected,
    /// A solvable challenge.
    Challenge(Challenge),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Challenge {
    pub rules: ChallengeRules,
    pub challenge: ChallengeData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeRules {
    pub algorithm: String,
    pub difficulty: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeData {
    pub id: String,
    #[serde(rename = "randomData")]
    pub random_data: String,
}

/// True when the body carries the challenge script element, solvable or not.
#[must_use]
pub fn is_anubis_page(body: &str) -> bool {
    body.contains(CHALLENGE_MARKER) && extract_challenge_json(body).is_some()
}

/// Classify a response body.
#[must_use]
pub fn detect(body: &str) -> Detection {
    if !body.contains(CHALLENGE_MARKER) {
        return Detection::NotAnubis;
    }
    let Some(json) = extract_challenge_json(body) else {
        return Detection::NotAnubis;
    };
    let value: serde_json::Value = match serde_json::from_str(&json) {
        Ok(value) => value,
        Err(_) => return Detection::NotAnubis,
    };
    if value.is_null() {
        return Detection::Rejected;
    }
    match serde_json::from_value::<Challenge>(value) {
        Ok(challenge) => Detection::Challenge(challenge),
        Err(err) => {
            tracing::debug!(error = %err, "malformed anubis challenge payload");
            Detection::NotAnubis
        }
    }
}

fn extract_challenge_json(body: &str) -> Option<String> {
    let document = scraper::Html::parse_document(body);
    let selector =
        scraper::Selector::parse(r#"script#anubis_challenge[type="application/json"]"#).ok()?;
    document
        .select(&selector)
        .next()
        .map(|script| script.inner_html())
}

/// Fingerprint of a client profile: SHA-256 over `name=value\n` for the
/// stated header subset in its stated order, absent or blank headers
/// skipped. `None` when nothing in the subset is present.
#[must_use]
pub fn header_fingerprint(headers: &[(String, String)]) -> Option<String> {
    let lookup: HashMap<String, &str> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.as_str()))
        .collect();

    let mut hasher = Sha256::new();
    let mut any = false;
    for name in FINGERPRINT_HEADERS {
        if let Some(value) = lookup.get(*name)
            && !value.trim().is_empty()
        {
            hasher.update(format!("{name}={value}\n").as_bytes());
            any = true;
        }
    }
    if !any {
        return None;
    }

    let digest = hasher.finalize();
    Some(digest[..8].iter().map(|b| format!("{b:02x}")).collect())
}

/// Cookie-cache key for a host plus an optional client fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CookieScope {
    HostOnly(String),
    Scoped(String, String),
}

impl CookieScope {
    #[must_use]
    pub fn for_request(host: &str, headers: &[(String, String)]) -> Self {
        let host = normalize_host(host);
        match header_fingerprint(headers) {
            Some(fingerprint) => Self::Scoped(host, fingerprint),
            None => Self::HostOnly(host),
        }
    }

    fn storage_key(&self) -> String {
        match self {
            Self::HostOnly(host) => format!("{ANUBIS_COOKIE_PREFIX}{host}"),
            Self::Scoped(host, fingerprint) => {
                format!("{ANUBIS_COOKIE_PREFIX}{host}|{fingerprint}")
            }
        }
    }

    fn host_fallback(&self) -> Self {
        match self {
            Self::HostOnly(host) | Self::Scoped(host, _) => Self::HostOnly(host.clone()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CachedCookie {
    cookie: String,
    expires_at: String,
}

/// Solves challenges and caches the winnings.
pub struct AnubisSolver {
    store: Arc<Store>,
    solving: Mutex<HashMap<String, Arc<Notify>>>,
}

impl AnubisSolver {
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            solving: Mutex::new(HashMap::new()),
        }
    }

    /// Cached cookie for this host and client profile, scoped key first,
    /// host-level fallback second.
    #[must_use]
    pub fn cached_cookie(&self, host: &str, headers: &[(String, String)]) -> Option<String> {
        let scope = CookieScope::for_request(host, headers);
        self.read_cookie(&scope)
            .or_else(|| self.read_cookie(&scope.host_fallback()))
    }

    fn read_cookie(&self, scope: &CookieScope) -> Option<String> {
        let raw = self.store.get_setting(&scope.storage_key()).ok()??;
        let cached: CachedCookie = serde_json::from_str(&raw).ok()?;
        let expires_at = rill_types::parse_time(&cached.expires_at).ok()?;
        if expires_at <= rill_types::now() {
            return None;
        }
        Some(cached.cookie)
    }

    fn write_cookie(&self, scope: &CookieScope, cookie: &str) {
        let record = CachedCookie {
            cookie: cookie.to_string(),
            expires_at: rill_types::format_time(
                rill_types::now() + chrono::Duration::from_std(COOKIE_TTL).unwrap_or_default(),
            ),
        };
        let value = match serde_json::to_string(&record) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, "failed to encode anubis cookie record");
                return;
            }
        };
        // Scoped key plus a host-level fallback so fingerprint-less callers
        // still find a cookie.
        for key in [scope.storage_key(), scope.host_fallback().storage_key()] {
            if let Err(err) = self.store.set_setting(&key, &value) {
                tracing::warn!(error = %err, key = %key, "failed to cache anubis cookie");
            }
        }
    }

    /// Obtain a cookie for a challenge observed at `page_url`.
    ///
    /// Concurrent callers for one cache key collapse: the first solves and
    /// submits, the rest wait for its broadcast and re-read the cache.
    pub async fn obtain(
        &self,
        page_url: &Url,
        challenge: &Challenge,
        challenge_cookies: &[String],
        headers: &[(String, String)],
        factory: &ClientFactory,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let host = page_url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(page_url.to_string()))?;
        let scope = CookieScope::for_request(host, headers);
        let key = scope.storage_key();

        let mut solving = self.solving.lock().await;
        if let Some(notify) = solving.get(&key).map(Arc::clone) {
            // Register interest while the registry lock is still held. The
            // leader broadcasts under the same lock, so enabling here cannot
            // miss the wakeup.
            let mut notified = pin!(notify.notified());
            notified.as_mut().enable();
            drop(solving);

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                () = notified => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                () = tokio::time::sleep(SETTLE_DELAY) => {}
            }
            return self
                .read_cookie(&scope)
                .or_else(|| self.read_cookie(&scope.host_fallback()))
                .ok_or_else(|| FetchError::Challenge("shared solve produced no cookie".to_string()));
        }
        solving.insert(key.clone(), Arc::new(Notify::new()));
        drop(solving);

        let result = self
            .solve_and_submit(page_url, challenge, challenge_cookies, headers, factory, cancel)
            .await;
        // Cache before waking the waiters, so their re-read finds the cookie.
        if let Ok(cookie) = &result {
            self.write_cookie(&scope, cookie);
        }
        // Remove the in-flight marker and wake waiters, whether the leader
        // succeeded, errored, or was cancelled.
        if let Some(notify) = self.solving.lock().await.remove(&key) {
            notify.notify_waiters();
        }
        result
    }

    async fn solve_and_submit(
        &self,
        page_url: &Url,
        challenge: &Challenge,
        challenge_cookies: &[String],
        headers: &[(String, String)],
        factory: &ClientFactory,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let solution = solve(challenge, cancel).await?;

        if !solution.wait.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                () = tokio::time::sleep(solution.wait) => {}
            }
        }

        let submit_url = submission_url(page_url, challenge, &solution)?;
        tracing::debug!(
            host = page_url.host_str().unwrap_or_default(),
            algorithm = %challenge.rules.algorithm,
            "submitting anubis challenge answer"
        );

        // Fresh client, redirects off: the 302 is where the cookie is set.
        let client = factory.plain_no_redirect()?;
        let mut request = client.get(submit_url);
        for name in SUBMISSION_HEADERS {
            if let Some((_, value)) = headers
                .iter()
                .find(|(candidate, _)| candidate.eq_ignore_ascii_case(name))
                && !value.trim().is_empty()
            {
                request = request.header(*name, value.as_str());
            }
        }
        if !challenge_cookies.is_empty() {
            request = request.header("cookie", challenge_cookies.join("; "));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status().as_u16();
        if status != 302 && status != 200 {
            return Err(FetchError::Challenge(format!(
                "pass-challenge returned HTTP {status}"
            )));
        }

        let cookie = auth_cookies(
            response
                .headers()
                .get_all(reqwest::header::SET_COOKIE)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        if cookie.is_empty() {
            return Err(FetchError::Challenge(
                "pass-challenge set no auth cookie".to_string(),
            ));
        }
        Ok(cookie)
    }
}


struct Solution {
    result: String,
    nonce: Option<u64>,
    elapsed_ms: Option<u64>,
    /// Minimum time the server expects to have elapsed before submission.
    wait: Duration,
}

async fn solve(challenge: &Challenge, cancel: &CancellationToken) -> Result<Solution> {
    let difficulty = u64::from(challenge.rules.difficulty);
    let random_data = challenge.challenge.random_data.clone();

    match challenge.rules.algorithm.as_str() {
        "metarefresh" => Ok(Solution {
            result: random_data,
            nonce: None,
            elapsed_ms: None,
            wait: Duration::from_millis(difficulty * 800 + 100),
        }),
        "fast" | "slow" => {
            let cancel = cancel.clone();
            let difficulty = challenge.rules.difficulty;
            let started = Instant::now();
            let outcome = tokio::task::spawn_blocking(move || {
                proof_of_work(&random_data, difficulty, &cancel)
            })
            .await
            .map_err(|e| FetchError::Challenge(format!("solver task failed: {e}")))??;
            Ok(Solution {
                result: outcome.hash,
                nonce: Some(outcome.nonce),
                elapsed_ms: Some(started.elapsed().as_millis() as u64),
                wait: Duration::ZERO,
            })
        }
        // "preact", and anything unrecognized falls back to it.
        _ => Ok(Solution {
            result: sha256_hex(random_data.as_bytes()),
            nonce: None,
            elapsed_ms: None,
            wait: Duration::from_millis(difficulty * 80 + 50),
        }),
    }
}

struct PowOutcome {
    nonce: u64,
    hash: String,
}

/// Smallest nonce whose `SHA256(randomData || decimal nonce)` opens with
/// `difficulty` zero hex nibbles.
fn proof_of_work(
    random_data: &str,
    difficulty: u32,
    cancel: &CancellationToken,
) -> Result<PowOutcome> {
    let mut nonce: u64 = 0;
    loop {
        if nonce % POW_CANCEL_STRIDE == 0 && cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let mut hasher = Sha256::new();
        hasher.update(random_data.as_bytes());
        hasher.update(nonce.to_string().as_bytes());
        let digest = hasher.finalize();

        if leading_zero_nibbles(&digest) >= difficulty {
            return Ok(PowOutcome {
                nonce,
                hash: digest.iter().map(|b| format!("{b:02x}")).collect(),
            });
        }
        nonce += 1;
    }
}

fn leading_zero_nibbles(digest: &[u8]) -> u32 {
    let mut count = 0;
    for byte in digest {
        if byte >> 4 != 0 {
            return count;
        }
        count += 1;
        if byte & 0x0F != 0 {
            return count;
        }
        count += 1;
    }
    count
}

/// Submission URL with the algorithm-specific query shape.
fn submission_url(page_url: &Url, challenge: &Challenge, solution: &Solution) -> Result<Url> {
    let origin = &page_url[..Position::BeforePath];
    let mut url = Url::parse(&format!("{origin}{PASS_CHALLENGE_PATH}"))
        .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;

    let mut redir = page_url.path().to_string();
    if let Some(query) = page_url.query() {
        redir.push('?');
        redir.push_str(query);
    }

    {
        let mut pairs = url.query_pairs_mut();
        match (solution.nonce, solution.elapsed_ms) {
            // Proof of work reports the nonce and how long it took.
            (Some(nonce), elapsed) => {
                pairs
                    .append_pair("id", &challenge.challenge.id)
                    .append_pair("response", &solution.result)
                    .append_pair("nonce", &nonce.to_string())
                    .append_pair("redir", &redir)
                    .append_pair("elapsedTime", &elapsed.unwrap_or(0).to_string());
            }
            (None, _) if challenge.rules.algorithm == "metarefresh" => {
                pairs
                    .append_pair("id", &challenge.challenge.id)
                    .append_pair("redir", &redir)
                    .append_pair("challenge", &solution.result);
            }
            (None, _) => {
                pairs
                    .append_pair("id", &challenge.challenge.id)
                    .append_pair("redir", &redir)
                    .append_pair("result", &solution.result);
            }
        }
    }
    Ok(url)
}

/// Filter, sort and join auth cookies from a `set-cookie` header set.
fn auth_cookies<'a>(set_cookies: impl Iterator<Item = &'a str>) -> String {
    let mut kept: Vec<String> = Vec::new();
    for raw in set_cookies {
        let pair = raw.split(';').next().unwrap_or("").trim();
        let Some((name, _)) = pair.split_once('=') else {
            continue;
        };
        let lname = name.trim().to_ascii_lowercase();
        if lname.contains("cookie-verification") {
            continue;
        }
        if lname.ends_with("-auth") || lname.contains("anubis") {
            kept.push(pair.to_string());
        }
    }
    kept.sort();
    kept.join("; ")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}
