//! Content fingerprints used to detect local edits.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Length of a hex-encoded SHA-256 digest
pub const HASH_LEN: usize = 64;

/// SHA-256 of `content`, hex encoded.
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// Read `path` as text and hash it. `Ok(None)` when the file does not exist.
pub async fn hash_file(path: &Path) -> std::io::Result<Option<(String, String)>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let hash = content_hash(&content);
            Ok(Some((content, hash)))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

/// Whether `hash` looks like something [`content_hash`] produced.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}
