//! Request signing verification.
//!
//! Clients speaking protocol versions above 2 append a signature frame to
//! their request. The core hands the raw payload, the signature and the
//! client token to a [`Verifier`] and propagates a rejection as the
//! request's error. Keys are compared in constant time to prevent timing
//! attacks.

use std::collections::HashMap;

use crate::error::{KilnError, Result};

/// Signing verifier collaborator.
///
/// Implementations decide whether a request payload was produced by the
/// owner of `token`. The core treats a failure as an authentication error
/// on that request and never as a fatal condition.
pub trait Verifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &[u8], token: &str) -> Result<()>;
}

/// Accepts every request. The default when no key material is configured.
pub struct NoVerifier;

impl Verifier for NoVerifier {
    fn verify(&self, _payload: &[u8], _signature: &[u8], _token: &str) -> Result<()> {
        Ok(())
    }
}

/// Verifies signatures against a static per-token key table.
pub struct StaticKeyVerifier {
    keys: HashMap<String, Vec<u8>>,
}

impl StaticKeyVerifier {
    pub fn new() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    pub fn with_key(mut self, token: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(token.into(), key.into());
        self
    }
}

impl Default for StaticKeyVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Verifier for StaticKeyVerifier {
    fn verify(&self, _payload: &[u8], signature: &[u8], token: &str) -> Result<()> {
        let key = self
            .keys
            .get(token)
            .ok_or_else(|| KilnError::SignatureRejected(format!("unknown token '{token}'")))?;

        if constant_time_eq(key, signature) {
            Ok(())
        } else {
            Err(KilnError::SignatureRejected(
                "signature mismatch".to_string(),
            ))
        }
    }
}

/// Constant-time byte comparison.
///
/// Always walks both slices in full so an attacker cannot learn the
/// position of the first mismatch from response latency.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.iter().zip(b.iter()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_verifier_accepts_everything() {
        let verifier = NoVerifier;
        assert!(verifier.verify(b"payload", b"", "").is_ok());
        assert!(verifier.verify(b"", b"garbage", "token").is_ok());
    }

    #[test]
    fn test_static_key_verifier_valid() {
        let verifier = StaticKeyVerifier::new().with_key("alice", b"secret".to_vec());
        assert!(verifier.verify(b"payload", b"secret", "alice").is_ok());
    }

    #[test]
    fn test_static_key_verifier_wrong_signature() {
        let verifier = StaticKeyVerifier::new().with_key("alice", b"secret".to_vec());
        let err = verifier.verify(b"payload", b"wrong!", "alice").unwrap_err();
        assert!(matches!(err, KilnError::SignatureRejected(_)));
    }

    #[test]
    fn test_static_key_verifier_unknown_token() {
        let verifier = StaticKeyVerifier::new().with_key("alice", b"secret".to_vec());
        let err = verifier.verify(b"payload", b"secret", "bob").unwrap_err();
        assert!(matches!(err, KilnError::SignatureRejected(_)));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(constant_time_eq(b"", b""));
        assert!(!constant_time_eq(b"aaaa", b"aaab"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
