//! Content fingerprints.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of the canonical JSON encoding of `value`.
///
/// Object keys are serialized in sorted order, so two equal values always
/// produce the same fingerprint.
#[must_use]
pub fn fingerprint(value: &serde_json::Value) -> String {
    let json = serde_json::to_string(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}
