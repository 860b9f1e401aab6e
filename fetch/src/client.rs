//! HTTP client construction.
//!
//! Two shapes of client come out of here: a plain client for feed polling
//! and icon downloads, and a fingerprinted session whose ordered header set
//! imitates a desktop Chrome for the surfaces that face bot checks (Anubis
//! submission, readability, image proxying). Every client is built fresh for
//! one fetch so challenge-tainted connection state can never leak into an
//! unrelated request.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::redirect::Policy;
use serde::Deserialize;
use url::Url;

use crate::{DEFAULT_USER_AGENT, FetchError, REQUEST_TIMEOUT_SECS, Result};

/// Which address family outbound connections may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpStack {
    /// OS default, falling back to the other family on connect failure.
    #[default]
    Default,
    Ipv4,
    Ipv6,
}

/// Forward proxy for the plain client.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// `http://`, `https://` or `socks5://` URL.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub proxy: Option<ProxyConfig>,
    pub ip_stack: IpStack,
}

/// Builds the short-lived clients used throughout the pipeline.
#[derive(Debug, Clone)]
pub struct ClientFactory {
    config: ClientConfig,
}

impl ClientFactory {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Plain client honouring proxy and IP-stack policy.
    pub fn plain(&self) -> Result<reqwest::Client> {
        self.build(self.config.ip_stack, Policy::limited(5))
    }

    /// Plain client pinned to a specific family, for the fallback leg of the
    /// `default` policy.
    pub fn plain_pinned(&self, stack: IpStack) -> Result<reqwest::Client> {
        self.build(stack, Policy::limited(5))
    }

    /// Plain client with redirects disabled, for requests that must observe
    /// a 302 themselves.
    pub fn plain_no_redirect(&self) -> Result<reqwest::Client> {
        self.build(self.config.ip_stack, Policy::none())
    }

    /// Fingerprinted session for challenge-facing requests. Redirects stay
    /// disabled when the caller needs to observe a 302 itself.
    pub fn fingerprint_session(
        &self,
        user_agent: &str,
        follow_redirects: bool,
    ) -> Result<FingerprintSession> {
        let policy = if follow_redirects {
            Policy::limited(5)
        } else {
            Policy::none()
        };
        let client = self.builder(self.config.ip_stack)?.redirect(policy).cookie_store(true).build()?;
        Ok(FingerprintSession::new(client, user_agent))
    }

    fn build(&self, stack: IpStack, redirect: Policy) -> Result<reqwest::Client> {
        Ok(self.builder(stack)?.redirect(redirect).build()?)
    }

    fn builder(&self, stack: IpStack) -> Result<reqwest::ClientBuilder> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10));

        // Binding a local address restricts resolved addresses to its family.
        match stack {
            IpStack::Default => {}
            IpStack::Ipv4 => {
                builder = builder.local_address(Some(IpAddr::from([0, 0, 0, 0])));
            }
            IpStack::Ipv6 => {
                builder = builder.local_address(Some(IpAddr::from([0u16; 8])));
            }
        }

        if let Some(proxy) = &self.config.proxy {
            builder = builder.proxy(build_proxy(proxy)?);
        }

        Ok(builder)
    }

    /// Dispatch a request built against a plain client. Under the `default`
    /// IP-stack policy a connect failure retries once per pinned family
    /// before giving up.
    pub async fn dispatch<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let client = self.plain()?;
        let first = build(&client).send().await;
        match first {
            Ok(response) => Ok(response),
            Err(err) if err.is_connect() && self.config.ip_stack == IpStack::Default => {
                tracing::debug!(error = %err, "connect failed on default stack, retrying pinned families");
                for stack in [IpStack::Ipv4, IpStack::Ipv6] {
                    let client = self.plain_pinned(stack)?;
                    match build(&client).send().await {
                        Ok(response) => return Ok(response),
                        Err(retry_err) if retry_err.is_connect() => continue,
                        Err(retry_err) => return Err(retry_err.into()),
                    }
                }
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn build_proxy(config: &ProxyConfig) -> Result<reqwest::Proxy> {
    let parsed = Url::parse(&config.url)
        .map_err(|_| FetchError::InvalidUrl(config.url.clone()))?;
    match parsed.scheme() {
        "http" | "https" | "socks5" | "socks5h" => {}
        scheme => return Err(FetchError::InvalidProtocol(scheme.to_string())),
    }

    let mut proxy = reqwest::Proxy::all(config.url.clone())
        .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        proxy = proxy.basic_auth(user, pass);
    }
    Ok(proxy)
}

/// A client plus the ordered Chrome-like header set it presents.
///
/// The header order is load-bearing: the Anubis fingerprint is computed over
/// these names in exactly this sequence, and the solver replays them when it
/// submits a challenge answer.
pub struct FingerprintSession {
    client: reqwest::Client,
    headers: Vec<(String, String)>,
}

impl FingerprintSession {
    fn new(client: reqwest::Client, user_agent: &str) -> Self {
        let user_agent = if user_agent.trim().is_empty() {
            DEFAULT_USER_AGENT
        } else {
            user_agent
        };
        let headers = vec![
            (
                "accept".to_string(),
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,\
                 image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7"
                    .to_string(),
            ),
            ("accept-language".to_string(), "en-US,en;q=0.9".to_string()),
            ("accept-encoding".to_string(), "gzip, deflate, br".to_string()),
            ("priority".to_string(), "u=0, i".to_string()),
            (
                "sec-ch-ua".to_string(),
                "\"Chromium\";v=\"127\", \"Not)A;Brand\";v=\"99\"".to_string(),
            ),
            ("sec-ch-ua-mobile".to_string(), "?0".to_string()),
            ("sec-ch-ua-platform".to_string(), "\"Windows\"".to_string()),
            ("sec-fetch-dest".to_string(), "document".to_string()),
            ("sec-fetch-mode".to_string(), "navigate".to_string()),
            ("sec-fetch-site".to_string(), "none".to_string()),
            ("sec-fetch-user".to_string(), "?1".to_string()),
            ("upgrade-insecure-requests".to_string(), "1".to_string()),
            ("user-agent".to_string(), user_agent.to_string()),
        ];
        Self { client, headers }
    }

    /// Start a GET with the fingerprint headers applied in order.
    pub fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.get(url);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// The ordered header set, for fingerprinting and replay.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_scheme_is_validated() {
        let err = build_proxy(&ProxyConfig {
            url: "ftp://proxy.example:21".to_string(),
            username: None,
            password: None,
        })
        .unwrap_err();
        assert!(matches!(err, FetchError::InvalidProtocol(_)));

        assert!(build_proxy(&ProxyConfig {
            url: "socks5://proxy.example:1080".to_string(),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
        })
        .is_ok());
    }

    #[test]
    fn session_headers_end_with_user_agent() {
        let factory = ClientFactory::new(ClientConfig::default());
        let session = factory.fingerprint_session("test-agent", true).unwrap();
        let headers = session.headers();
        assert_eq!(headers.first().map(|(n, _)| n.as_str()), Some("accept"));
        assert_eq!(headers.last().map(|(n, _)| n.as_str()), Some("user-agent"));
        assert_eq!(headers.last().map(|(_, v)| v.as_str()), Some("test-agent"));
    }

    #[test]
    fn blank_user_agent_falls_back_to_chrome() {
        let factory = ClientFactory::new(ClientConfig::default());
        let session = factory.fingerprint_session("  ", true).unwrap();
        assert_eq!(
            session.headers().last().map(|(_, v)| v.as_str()),
            Some(DEFAULT_USER_AGENT)
        );
    }
}
