//! Host normalization.
//!
//! Scheduler keys, rate-limit lookups and the Anubis cookie cache all key on
//! the same normalized host form: lowercased, trailing dot trimmed, port
//! removed, IPv6 brackets stripped. Keys that already carry a `|`-scoped
//! fingerprint suffix are re-split so the suffix survives normalization.

use url::Url;

/// Normalize a raw host (possibly `host:port`, possibly bracketed IPv6,
/// possibly carrying a `|suffix` cache scope).
#[must_use]
pub fn normalize_host(raw: &str) -> String {
    if let Some((host, suffix)) = raw.split_once('|') {
        return format!("{}|{suffix}", normalize_host(host));
    }

    let mut host = raw.trim().to_ascii_lowercase();

    // Bracketed IPv6, with or without a port: keep the literal only.
    if let Some(stripped) = host.strip_prefix('[') {
        if let Some(close) = stripped.find(']') {
            host = stripped[..close].to_string();
        }
        return host.trim_end_matches('.').to_string();
    }

    // A single colon separates a port; more than one is a bare IPv6 literal.
    if let Some(colon) = host.rfind(':')
        && !host[..colon].contains(':')
    {
        host.truncate(colon);
    }

    host.trim_end_matches('.').to_string()
}

/// Host of a URL string, normalized. Errors surface as
/// [`crate::FetchError::InvalidUrl`] at the call sites that need them; this
/// returns `None` for unparseable input.
#[must_use]
pub fn host_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str().map(normalize_host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_trims_trailing_dot() {
        assert_eq!(normalize_host("Example.COM."), "example.com");
    }

    #[test]
    fn strips_port() {
        assert_eq!(normalize_host("example.com:8080"), "example.com");
    }

    #[test]
    fn ipv6_brackets_and_port() {
        assert_eq!(normalize_host("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(normalize_host("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn scoped_suffix_survives() {
        assert_eq!(
            normalize_host("Example.com:443|deadbeef01234567"),
            "example.com|deadbeef01234567"
        );
    }

    #[test]
    fn host_of_url() {
        assert_eq!(
            host_of("https://Example.com:8443/feed.xml").as_deref(),
            Some("example.com")
        );
        assert_eq!(host_of("not a url"), None);
    }
}
