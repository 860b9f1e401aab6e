//! Canonical entry fingerprints.
//!
//! An entry is identified within its feed by a SHA-256 fingerprint so the
//! same item re-fetched later (possibly with a reshuffled URL fragment) maps
//! onto the same row. The fingerprint is computed at entry creation and by
//! the historical migration that deduplicates pre-hash rows, so both call
//! into this one function.

use sha2::{Digest, Sha256};

/// Compute the content fingerprint for an entry.
///
/// Preference order:
/// 1. A non-empty URL (trimmed, fragment removed) hashes alone. Fragments
///    are navigation state, not identity: `…#reply10` and `…#reply20` are
///    the same item.
/// 2. Otherwise a non-empty title or content hashes as `title || content`.
/// 3. Otherwise the row ID seeds a stable synthetic fingerprint.
///
/// Always returns 64 lowercase hex characters.
#[must_use]
pub fn entry_hash(url: &str, title: &str, content: &str, id: i64) -> String {
    let url = strip_fragment(url).trim();
    if !url.is_empty() {
        return sha256_hex(url.as_bytes());
    }

    let title = title.trim();
    let content = content.trim();
    if !title.is_empty() || !content.is_empty() {
        let mut hasher = Sha256::new();
        hasher.update(title.as_bytes());
        hasher.update(content.as_bytes());
        return hex_encode(&hasher.finalize());
    }

    sha256_hex(format!("entry:{id}").as_bytes())
}

fn strip_fragment(url: &str) -> &str {
    match url.find('#') {
        Some(idx) => &url[..idx],
        None => url,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
