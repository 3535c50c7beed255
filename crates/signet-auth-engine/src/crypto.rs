//! Small cryptographic helpers shared by the engine components.
//!
//! - Random tokens from the system CSPRNG via `ring`.
//! - SHA-256 digests encoded as unpadded base64url.
//! - Constant-time equality for secrets supplied by clients.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::{AuthEngineError, Result};

/// Fill `len` bytes from the system CSPRNG and encode them as base64url.
///
/// # Errors
///
/// Returns [`AuthEngineError::Unavailable`] if the CSPRNG fails.
pub fn random_token(len: usize) -> Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = vec![0u8; len];
    rng.fill(&mut bytes)
        .map_err(|_| AuthEngineError::unavailable("system CSPRNG failure"))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// `BASE64URL(SHA256(input))` without padding.
pub fn sha256_b64(input: &str) -> String {
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// Compare two byte strings without short-circuiting on the first mismatch.
///
/// Length is not secret: differing lengths return `false` immediately.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }

    diff == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_token_length_and_alphabet() {
        let token = random_token(32).unwrap();
        // 32 bytes base64url encoded = 43 characters (no padding).
        assert_eq!(token.len(), 43);
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
    }

    #[test]
    fn random_tokens_differ() {
        assert_ne!(random_token(32).unwrap(), random_token(32).unwrap());
    }

    #[test]
    fn sha256_b64_known_vector() {
        // SHA-256("abc"), base64url without padding.
        assert_eq!(
            sha256_b64("abc"),
            "ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0"
        );
    }

    #[test]
    fn constant_time_eq_behaviour() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secret!"));
        assert!(constant_time_eq(b"", b""));
    }
}
