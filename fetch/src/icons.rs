//! Favicon backfill.
//!
//! When a feed has no cached icon, the fetcher tries the site origin's
//! `/favicon.ico` once per refresh. Everything here is best-effort: failures
//! log at debug and the feed simply stays icon-less until the next pass.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use rill_storage::Store;

use crate::client::ClientFactory;

/// Largest icon accepted, in bytes.
const MAX_ICON_BYTES: usize = 512 * 1024;

pub(crate) async fn backfill(
    store: &Arc<Store>,
    factory: &ClientFactory,
    feed_id: i64,
    site_url: &str,
    icon_dir: &Path,
    cancel: &CancellationToken,
) {
    let Some(icon_url) = favicon_url(site_url) else {
        return;
    };

    let send = factory.dispatch(|client| client.get(icon_url.as_str()));
    let response = tokio::select! {
        _ = cancel.cancelled() => return,
        response = send => match response {
            Ok(response) => response,
            Err(err) => {
                tracing::debug!(feed = feed_id, error = %err, "icon fetch failed");
                return;
            }
        },
    };

    if response.status().as_u16() != 200 {
        tracing::debug!(feed = feed_id, status = response.status().as_u16(), "no icon");
        return;
    }

    let bytes = match response.bytes().await {
        Ok(bytes) if !bytes.is_empty() && bytes.len() <= MAX_ICON_BYTES => bytes,
        Ok(_) => return,
        Err(err) => {
            tracing::debug!(feed = feed_id, error = %err, "icon read failed");
            return;
        }
    };

    if let Err(err) = std::fs::create_dir_all(icon_dir) {
        tracing::debug!(error = %err, "icon dir creation failed");
        return;
    }
    let path = icon_dir.join(format!("{feed_id}.ico"));
    if let Err(err) = std::fs::write(&path, &bytes) {
        tracing::debug!(feed = feed_id, error = %err, "icon write failed");
        return;
    }

    if let Err(err) = store.update_feed_icon_path(feed_id, &path.to_string_lossy()) {
        tracing::warn!(feed = feed_id, error = %err, "icon path update failed");
    }
}

fn favicon_url(site_url: &str) -> Option<Url> {
    let parsed = Url::parse(site_url).ok()?;
    parsed.join("/favicon.ico").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn favicon_is_origin_relative() {
        assert_eq!(
            favicon_url("https://example.com/blog/post/1").unwrap().as_str(),
            "https://example.com/favicon.ico"
        );
        assert!(favicon_url("not a url").is_none());
    }
}
