//! PKCE (RFC 7636) and `state` generation

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// A PKCE verifier with its S256 challenge
#[derive(Clone)]
pub struct PkcePair {
    /// Secret verifier, sent only to the token endpoint
    pub verifier: String,
    /// `BASE64URL(SHA256(verifier))`, sent in the authorization URL
    pub challenge: String,
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PkcePair")
            .field("verifier", &"[redacted]")
            .field("challenge", &self.challenge)
            .finish()
    }
}

impl PkcePair {
    /// Challenge method sent alongside the challenge
    pub const METHOD: &'static str = "S256";

    /// Generate a fresh pair from 32 random bytes
    #[must_use]
    pub fn generate() -> Self {
        let verifier_bytes: [u8; 32] = rand::random();
        let verifier = URL_SAFE_NO_PAD.encode(verifier_bytes);
        let challenge = s256_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }

    /// Check this pair's challenge against its verifier, as the IdP would
    #[must_use]
    pub fn is_valid(&self) -> bool {
        verify_s256(&self.verifier, &self.challenge)
    }
}

/// Compute the S256 challenge for a verifier
#[must_use]
pub fn s256_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Verify a challenge against a verifier per S256
#[must_use]
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    let expected = s256_challenge(verifier);
    expected.as_bytes().ct_eq(challenge.as_bytes()).into()
}

/// Generate a random `state` parameter
#[must_use]
pub fn generate_state() -> String {
    let state_bytes: [u8; 16] = rand::random();
    URL_SAFE_NO_PAD.encode(state_bytes)
}
