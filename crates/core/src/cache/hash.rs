//! Session keys and content hashes.

use sha2::{Digest, Sha256};

/// Derive the session key for a canonical URL.
///
/// An empty `account` gives the shared (non identity-scoped) key.
pub fn session_key(canonical_url: &str, account: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(account.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_url.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of document bytes, used for integrity checks.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
