//! Content fingerprints used for change detection.

use base64::{engine::general_purpose::URL_SAFE, Engine};
use sha2::{Digest, Sha256};

/// SHA-256 of `bytes`, URL-safe base64 encoded (always 44 characters).
pub fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    URL_SAFE.encode(hasher.finalize())
}
