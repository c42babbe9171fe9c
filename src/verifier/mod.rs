//! Inbound bearer token verification
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Look the key up in the issuer's cached JWKS; an unknown `kid` forces one
//!    rate-limited refresh before failing (a rotation may have happened).
//! 3. Verify the signature, `iss`, and `exp`/`nbf` with clock leeway.
//! 4. Accept the token if any of its audiences is in the accepted set.
//!
//! The JWKS is cached per issuer with a long TTL. A failed refresh keeps
//! serving the stale set; only a cold cache surfaces the fetch error.

mod bearer;
mod jwks;
mod middleware;

pub use bearer::{BearerVerifier, VerifiedClaims};
pub use jwks::JwksCache;
pub use middleware::{VerifierState, bearer_auth, is_public_path};

/// Reasons an inbound token is rejected
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    /// JWT decode, signature, issuer, or expiry failure
    #[error("{0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// The JWT header has no `kid`
    #[error("token header has no 'kid'")]
    MissingKeyId,

    /// No key with this `kid` in the issuer's JWKS
    #[error("no signing key found for kid '{0}'")]
    UnknownKeyId(String),

    /// None of the token's audiences is accepted
    #[error("invalid audience: expected one of [{expected}], got {actual}")]
    InvalidAudience {
        /// Accepted audiences
        expected: String,
        /// Audience claim of the token
        actual: String,
    },

    /// Header algorithm is not an asymmetric algorithm we accept
    #[error("unsupported signing algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The JWKS could not be fetched and no cached copy exists
    #[error("signing keys unavailable: {0}")]
    KeySource(String),
}

impl VerificationError {
    /// Whether this failure is on our side rather than the caller's
    #[must_use]
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::KeySource(_))
    }
}
