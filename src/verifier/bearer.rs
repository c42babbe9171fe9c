//! Bearer token verification against an issuer's JWKS

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{
    Algorithm, DecodingKey, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use serde_json::Value;
use tracing::{debug, warn};

use super::VerificationError;
use super::jwks::JwksCache;
use crate::config::Config;
use crate::oauth::claims::{Audience, TokenClaims};
use crate::Result;

/// Claims of a verified inbound token.
///
/// Lives in the request extensions for one request only.
#[derive(Debug, Clone)]
pub struct VerifiedClaims {
    /// Typed registered claims
    pub claims: TokenClaims,
    /// Full payload, for custom claims
    pub raw: Value,
}

impl VerifiedClaims {
    /// `sub`
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref()
    }

    /// `client_id`, else `azp`
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.claims.client()
    }

    /// Granted scopes
    pub fn scopes(&self) -> impl Iterator<Item = &str> {
        self.claims.scopes()
    }

    /// Whether `scope` was granted
    #[must_use]
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes().any(|s| s == scope)
    }

    /// A custom claim
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }
}

/// Verifies inbound bearer tokens for one issuer
pub struct BearerVerifier {
    issuer: String,
    jwks_uri: String,
    audiences: Vec<String>,
    leeway: Duration,
    refresh_on_unknown_kid: bool,
    jwks: Arc<JwksCache>,
}

impl BearerVerifier {
    /// Create a verifier
    pub fn new(
        issuer: impl Into<String>,
        jwks_uri: impl Into<String>,
        audiences: Vec<String>,
        jwks: Arc<JwksCache>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            jwks_uri: jwks_uri.into(),
            audiences,
            leeway: Duration::from_secs(60),
            refresh_on_unknown_kid: true,
            jwks,
        }
    }

    /// Clock skew tolerance
    #[must_use]
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Whether an unknown `kid` forces one JWKS refresh before failing
    #[must_use]
    pub fn with_refresh_on_unknown_kid(mut self, enabled: bool) -> Self {
        self.refresh_on_unknown_kid = enabled;
        self
    }

    /// Build from configuration, with a JWKS cache of its own
    pub fn from_config(config: &Config, http: reqwest::Client) -> Result<Self> {
        let verifier = &config.verifier;
        let jwks = Arc::new(JwksCache::new(
            http,
            verifier.jwks_ttl,
            verifier.min_refresh_interval,
        ));
        let audiences = verifier.accepted_audiences(&config.idp);
        if audiences.is_empty() {
            warn!("No accepted audiences configured; the audience check is skipped");
        }

        Ok(Self::new(config.idp.issuer()?, config.idp.jwks_url()?, audiences, jwks)
            .with_leeway(verifier.leeway)
            .with_refresh_on_unknown_kid(verifier.refresh_on_unknown_kid))
    }

    /// Accepted audiences
    #[must_use]
    pub fn audiences(&self) -> &[String] {
        &self.audiences
    }

    /// Verify `token` and return its claims
    pub async fn verify(
        &self,
        token: &str,
    ) -> std::result::Result<VerifiedClaims, VerificationError> {
        let header = jsonwebtoken::decode_header(token)?;
        let kid = header.kid.ok_or(VerificationError::MissingKeyId)?;
        let alg = accepted_algorithm(header.alg)?;

        let key = self.decoding_key(&kid).await?;

        let mut validation = Validation::new(alg);
        validation.leeway = self.leeway.as_secs();
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        // Multi-audience matching is done below
        validation.validate_aud = false;

        let data = jsonwebtoken::decode::<Value>(token, &key, &validation)?;
        let claims: TokenClaims = serde_json::from_value(data.claims.clone())
            .map_err(|e| VerificationError::Jwt(jsonwebtoken::errors::Error::from(e)))?;

        self.check_audience(claims.aud.as_ref())?;

        debug!(
            sub = claims.sub.as_deref().unwrap_or("-"),
            client_id = claims.client().unwrap_or("-"),
            "Token verified"
        );
        Ok(VerifiedClaims {
            claims,
            raw: data.claims,
        })
    }

    async fn decoding_key(&self, kid: &str) -> std::result::Result<DecodingKey, VerificationError> {
        let jwks = self.jwks.get(&self.issuer, &self.jwks_uri).await?;
        if let Some(key) = find_key(&jwks, kid) {
            return Ok(key);
        }

        if self.refresh_on_unknown_kid {
            debug!(kid = %kid, "Key not in cached JWKS, forcing refresh");
            match self.jwks.force_refresh(&self.issuer, &self.jwks_uri).await {
                Ok(Some(jwks)) => {
                    if let Some(key) = find_key(&jwks, kid) {
                        return Ok(key);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(kid = %kid, error = %e, "Forced JWKS refresh failed"),
            }
        }

        Err(VerificationError::UnknownKeyId(kid.to_string()))
    }

    fn check_audience(&self, aud: Option<&Audience>) -> std::result::Result<(), VerificationError> {
        if self.audiences.is_empty() {
            return Ok(());
        }
        match aud {
            Some(aud) if aud.intersects(&self.audiences) => Ok(()),
            other => Err(VerificationError::InvalidAudience {
                expected: self.audiences.join(", "),
                actual: other.map_or_else(|| "none".to_string(), ToString::to_string),
            }),
        }
    }
}

fn accepted_algorithm(alg: Algorithm) -> std::result::Result<Algorithm, VerificationError> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(alg),
        other => Err(VerificationError::UnsupportedAlgorithm(format!("{other:?}"))),
    }
}

/// Find a JWK by `kid` and convert it to a `DecodingKey`
fn find_key(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    let jwk = jwks.find(kid)?;
    match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
        AlgorithmParameters::EllipticCurve(ec) => {
            DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
        }
        _ => None,
    }
}
