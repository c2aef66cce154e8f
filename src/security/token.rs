//! Shared-secret comparison for bearer and verification tokens

use sha2::{Digest, Sha256};

fn sha256(input: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.finalize().into()
}

/// Compare a presented token against the configured secret
///
/// Both sides are hashed first so the comparison is fixed-length and does not
/// leak the secret's length.
#[must_use]
pub fn tokens_match(expected: &str, provided: &str) -> bool {
    constant_time_eq(&sha256(expected), &sha256(provided))
}

/// Constant-time byte comparison
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Extract the token from an `Authorization: Bearer <token>` header value
#[must_use]
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
