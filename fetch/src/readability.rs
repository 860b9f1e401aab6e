//! Reader-mode extraction.
//!
//! For an entry with a URL, fetches the article through the fingerprinted
//! session (same challenge handling as the feed fetch), reduces the page to
//! its main content, and persists the result on the entry. The cached value
//! is authoritative on later calls.
//!
//! Post-processing mirrors what lazy-loading sites need: `<img>` elements
//! whose real source hides in `data-*` attributes are rewritten, `<noscript>`
//! fallbacks around images are unwrapped, and date chrome is dropped.

use std::sync::Arc;

use scraper::{ElementRef, Html, Node, Selector};
use tokio_util::sync::CancellationToken;
use url::Url;

use rill_storage::Store;

use crate::anubis::{AnubisSolver, Detection, is_anubis_page};
use crate::client::ClientFactory;
use crate::{FetchError, Result};

/// Candidate roots, most specific first.
const CONTENT_ROOTS: &[&str] = &[
    "article",
    "main",
    "[role=\"main\"]",
    "#content",
    ".post-content",
    ".article-content",
    ".content",
    "body",
];

/// Tags preserved in reader output. Anything else contributes only its
/// children.
const KEPT_TAGS: &[&str] = &[
    "p", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "blockquote", "pre", "code",
    "table", "thead", "tbody", "tr", "th", "td", "figure", "figcaption", "em", "strong", "b",
    "i", "br", "hr",
];

/// Tags whose subtrees never reach the reader.
const DROPPED_TAGS: &[&str] = &[
    "script", "style", "iframe", "form", "nav", "footer", "header", "aside", "button", "svg",
    "template", "dialog",
];

/// Attributes that lazy-loading schemes park the real image URL in, probed
/// in order.
const LAZY_SRC_ATTRS: &[&str] = &["data-src", "data-srcset", "data-lazy-src", "data-original"];

pub struct ReadabilityExtractor {
    store: Arc<Store>,
    factory: ClientFactory,
    solver: Arc<AnubisSolver>,
    user_agent: String,
}

impl ReadabilityExtractor {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        factory: ClientFactory,
        solver: Arc<AnubisSolver>,
        user_agent: String,
    ) -> Self {
        Self {
            store,
            factory,
            solver,
            user_agent,
        }
    }

    /// Reader content for an entry, cache-through.
    pub async fn readable_content(
        &self,
        entry_id: i64,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let entry = self.store.get_entry(entry_id)?;
        if let Some(cached) = entry.readable_content
            && !cached.is_empty()
        {
            return Ok(cached);
        }

        let url = entry
            .url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| FetchError::InvalidUrl("entry has no url".to_string()))?;
        let parsed =
            Url::parse(&url).map_err(|_| FetchError::InvalidUrl(url.clone()))?;

        let html = self.fetch_article(&parsed, 0, cancel).await?;
        let readable = extract_readable(&html, &parsed)?;

        self.store.update_entry_readable_content(entry_id, &readable)?;
        Ok(readable)
    }

    /// GET through the fingerprint session with the challenge retry ladder.
    async fn fetch_article(
        &self,
        url: &Url,
        retry_count: u32,
        cancel: &CancellationToken,
    ) -> Result<String> {
        // A fresh session per attempt: a challenged connection is never
        // reused after the cookie is won.
        let session = self.factory.fingerprint_session(&self.user_agent, true)?;
        let cookie = url
            .host_str()
            .and_then(|host| self.solver.cached_cookie(host, session.headers()));

        let mut request = session.get(url.as_str());
        if let Some(cookie) = &cookie {
            request = request.header("cookie", cookie);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(FetchError::Status(status));
        }

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
            body = response.text() => body?,
        };

        if !is_anubis_page(&body) {
            return Ok(body);
        }

        match crate::anubis::detect(&body) {
            Detection::NotAnubis => Ok(body),
            Detection::Rejected => Err(FetchError::UpstreamRejected),
            Detection::Challenge(challenge) => {
                if retry_count >= 2 {
                    return Err(FetchError::RetryExceeded);
                }
                let _cookie = self
                    .solver
                    .obtain(
                        url,
                        &challenge,
                        &set_cookies,
                        session.headers(),
                        &self.factory,
                        cancel,
                    )
                    .await?;
                Box::pin(self.fetch_article(url, retry_count + 1, cancel)).await
            }
        }
    }
}

/// Reduce an HTML document to reader-mode HTML.
pub fn extract_readable(html: &str, base_url: &Url) -> Result<String> {
    let document = Html::parse_document(html);
    let root = find_content_root(&document)
        .ok_or_else(|| FetchError::Parse("no extractable content".to_string()))?;

    let mut out = String::new();
    render_children(root, base_url, &mut out);
    let out = out.trim().to_string();
    if out.is_empty() {
        return Err(FetchError::Parse("no extractable content".to_string()));
    }
    Ok(out)
}

fn find_content_root(document: &Html) -> Option<ElementRef<'_>> {
    for selector_str in CONTENT_ROOTS {
        if let Ok(selector) = Selector::parse(selector_str)
            && let Some(element) = document.select(&selector).next()
            && text_len(element) > 0
        {
            return Some(element);
        }
    }
    None
}

fn text_len(element: ElementRef<'_>) -> usize {
    element
        .text()
        .map(|t| t.chars().filter(|c| !c.is_whitespace()).count())
        .sum()
}

fn render_children(element: ElementRef<'_>, base_url: &Url, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&escape_html(text)),
            Node::Element(_) => {
                if let Some(el) = ElementRef::wrap(child) {
                    render_element(el, base_url, out);
                }
            }
            _ => {}
        }
    }
}

fn render_element(element: ElementRef<'_>, base_url: &Url, out: &mut String) {
    let tag = element.value().name();

    if DROPPED_TAGS.contains(&tag) || is_date_chrome(element) {
        return;
    }

    match tag {
        "img" => render_img(element, base_url, out),
        "noscript" => {
            // Keep the fallback content only when it actually holds images.
            if let Ok(img) = Selector::parse("img")
                && element.select(&img).next().is_some()
            {
                render_children(element, base_url, out);
            }
        }
        "a" => {
            let href = element
                .value()
                .attr("href")
                .and_then(|href| resolve_url(href, base_url));
            if let Some(href) = href {
                out.push_str(&format!("<a href=\"{}\">", escape_attr(&href)));
                render_children(element, base_url, out);
                out.push_str("</a>");
            } else {
                render_children(element, base_url, out);
            }
        }
        "br" | "hr" => {
            out.push('<');
            out.push_str(tag);
            out.push_str("/>");
        }
        _ if KEPT_TAGS.contains(&tag) => {
            out.push('<');
            out.push_str(tag);
            out.push('>');
            render_children(element, base_url, out);
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        // Wrappers (div, span, section, ...) dissolve into their children.
        _ => render_children(element, base_url, out),
    }
}

fn render_img(element: ElementRef<'_>, base_url: &Url, out: &mut String) {
    let Some(src) = effective_img_src(element, base_url) else {
        return;
    };
    out.push_str(&format!("<img src=\"{}\"", escape_attr(&src)));
    if let Some(alt) = element.value().attr("alt")
        && !alt.is_empty()
    {
        out.push_str(&format!(" alt=\"{}\"", escape_attr(alt)));
    }
    out.push_str("/>");
}

/// The image's real source: a genuine `src`, or the first lazy-loading
/// attribute holding a resolvable URL when `src` is missing or a data-URL
/// placeholder.
fn effective_img_src(element: ElementRef<'_>, base_url: &Url) -> Option<String> {
    let src = element.value().attr("src").unwrap_or("");
    let placeholder = src.is_empty() || src.starts_with("data:");
    if !placeholder {
        return resolve_url(src, base_url);
    }

    for attr in LAZY_SRC_ATTRS {
        if let Some(value) = element.value().attr(attr) {
            // srcset-shaped values list candidates; the URL is the first
            // token of the first candidate.
            let candidate = value.split(',').next().unwrap_or("").trim();
            let candidate = candidate.split_whitespace().next().unwrap_or("");
            if !candidate.is_empty()
                && !candidate.starts_with("data:")
                && let Some(resolved) = resolve_url(candidate, base_url)
            {
                return Some(resolved);
            }
        }
    }
    None
}

/// Date badges and published-at chrome have no place in reader view.
fn is_date_chrome(element: ElementRef<'_>) -> bool {
    if let Some(class) = element.value().attr("class")
        && class.to_ascii_lowercase().contains("date")
    {
        return true;
    }
    element
        .value()
        .attr("itemprop")
        .is_some_and(|itemprop| itemprop.contains("datePublished"))
}

fn resolve_url(href: &str, base_url: &Url) -> Option<String> {
    let resolved = base_url.join(href.trim()).ok()?;
    matches!(resolved.scheme(), "http" | "https").then(|| resolved.to_string())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(text: &str) -> String {
    escape_html(text).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/posts/1").unwrap()
    }

    #[test]
    fn extracts_article_content() {
        let html = r#"<html><body>
            <nav>Navigation junk</nav>
            <article><h1>Title</h1><p>Hello <strong>world</strong>.</p></article>
            <footer>footer junk</footer>
        </body></html>"#;
        let out = extract_readable(html, &base()).unwrap();
        assert!(out.contains("<h1>Title</h1>"));
        assert!(out.contains("<strong>world</strong>"));
        assert!(!out.contains("Navigation"));
        assert!(!out.contains("footer junk"));
    }

    #[test]
    fn lazy_images_are_rewritten() {
        let html = r#"<article><p>text</p>
            <img src="data:image/gif;base64,R0lGOD" data-src="/images/real.jpg" alt="pic">
        </article>"#;
        let out = extract_readable(html, &base()).unwrap();
        assert!(out.contains(r#"<img src="https://example.com/images/real.jpg" alt="pic"/>"#));
        assert!(!out.contains("data:image/gif"));
    }

    #[test]
    fn srcset_first_candidate_wins() {
        let html = r#"<article><p>text</p>
            <img data-srcset="/a-480.jpg 480w, /a-800.jpg 800w">
        </article>"#;
        let out = extract_readable(html, &base()).unwrap();
        assert!(out.contains(r#"<img src="https://example.com/a-480.jpg"/>"#));
    }

    #[test]
    fn noscript_images_are_unwrapped() {
        let html = r#"<article><p>text</p>
            <noscript><img src="/real.png"></noscript>
            <noscript>tracking pixel text</noscript>
        </article>"#;
        let out = extract_readable(html, &base()).unwrap();
        assert!(out.contains(r#"<img src="https://example.com/real.png"/>"#));
        assert!(!out.contains("tracking pixel"));
    }

    #[test]
    fn date_elements_are_removed() {
        let html = r#"<article>
            <span class="post-Date">January 1</span>
            <time itemprop="datePublished dateModified">2025-01-01</time>
            <p>Body text</p>
        </article>"#;
        let out = extract_readable(html, &base()).unwrap();
        assert!(!out.contains("January 1"));
        assert!(!out.contains("2025-01-01"));
        assert!(out.contains("<p>Body text</p>"));
    }

    #[test]
    fn links_resolve_against_base() {
        let html = r#"<article><p><a href="../other">link</a></p></article>"#;
        let out = extract_readable(html, &base()).unwrap();
        assert!(out.contains(r#"<a href="https://example.com/other">link</a>"#));
    }

    #[test]
    fn empty_page_is_an_error() {
        let err = extract_readable("<html><body></body></html>", &base()).unwrap_err();
        assert!(matches!(err, FetchError::Parse(_)));
    }
}
