//! Short stable digests used to build cache and rate limit keys.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `input`, truncated to `len` characters.
pub fn short_digest(input: &str, len: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(len);
    encoded
}
