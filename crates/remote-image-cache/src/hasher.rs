//! Filesystem-safe identifiers for cache keys

use sha2::{Digest, Sha256};

/// Hash a cache key (usually a URL) into a 64 character lower-case hex string
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}
