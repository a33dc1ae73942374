use sha2::{Digest, Sha256};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Returns `true` if `expected` is the SHA-256 hex digest of `data`.
///
/// Comparison ignores ASCII case so upper-case digests are accepted.
pub fn verify_checksum(data: &[u8], expected: &str) -> bool {
    checksum_bytes(data).eq_ignore_ascii_case(expected.trim())
}
