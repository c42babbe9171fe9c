//! Token and identity types

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::claims::{TokenClaims, decode_unverified};
use super::endpoint::TokenResponse;
use crate::config::is_configured;
use crate::{Error, Result};

/// Lifetime assumed when the IdP omits both `exp` and `expires_in`
const DEFAULT_LIFETIME_SECS: u64 = 3600;

/// Current Unix time in seconds
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A downstream service's registered OAuth identity.
///
/// Immutable after discovery; the `name` keys every per-service cache.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Human-readable display name
    pub name: String,
    /// Client id registered for the service
    pub client_id: String,
    /// Client secret registered for the service
    #[serde(default, skip_serializing)]
    pub client_secret: Option<String>,
    /// Scope the service requires
    pub required_scope: String,
}

impl ServiceIdentity {
    /// Create an identity
    pub fn new(
        name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        required_scope: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            client_id: client_id.into(),
            client_secret: client_secret.filter(|s| is_configured(s)),
            required_scope: required_scope.into(),
        }
    }

    /// The service's client secret.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no usable secret is registered.
    pub fn secret(&self) -> Result<&str> {
        self.client_secret
            .as_deref()
            .filter(|s| is_configured(s))
            .ok_or_else(|| {
                Error::Config(format!(
                    "no client secret registered for service '{}'",
                    self.name
                ))
            })
    }

    /// Whether a usable secret is registered
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.secret().is_ok()
    }
}

impl fmt::Debug for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceIdentity")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "[redacted]"),
            )
            .field("required_scope", &self.required_scope)
            .finish()
    }
}

/// Broad credential obtained from the interactive login.
///
/// Only ever sent to the IdP as a `subject_token`, never to a service.
#[derive(Clone)]
pub struct MasterToken {
    /// Bearer value
    pub access_token: String,
    /// Refresh token, if the flow supplied one
    pub refresh_token: Option<String>,
    /// Expiry (Unix seconds)
    pub expires_at: u64,
    /// Scopes granted according to the token response
    pub scope: Option<String>,
    /// Claims read from the token (empty for opaque tokens)
    pub claims: TokenClaims,
}

impl MasterToken {
    /// Build from a token-endpoint response. `exp` wins over `expires_in`.
    #[must_use]
    pub fn from_response(response: TokenResponse) -> Self {
        let claims = decode_unverified(&response.access_token).unwrap_or_default();
        let expires_at = claims.exp.unwrap_or_else(|| {
            unix_now() + response.expires_in.unwrap_or(DEFAULT_LIFETIME_SECS)
        });
        let scope = response.scope.or_else(|| claims.scope.clone());

        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at,
            scope,
            claims,
        }
    }

    /// Still usable, with `buffer` to spare before expiry
    #[must_use]
    pub fn is_valid(&self, buffer: Duration) -> bool {
        unix_now() + buffer.as_secs() < self.expires_at
    }

    /// Past `exp`
    #[must_use]
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.expires_at
    }

    /// Time until expiration
    #[must_use]
    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at
            .checked_sub(unix_now())
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }

    /// Subject claim
    #[must_use]
    pub fn subject(&self) -> Option<&str> {
        self.claims.sub.as_deref()
    }
}

impl fmt::Debug for MasterToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterToken")
            .field("access_token", &"[redacted]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[redacted]"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("subject", &self.claims.sub)
            .finish()
    }
}

/// Short-lived proof of a service's own identity
#[derive(Clone)]
pub struct ActorToken {
    /// Bearer value
    pub token: String,
    /// Expiry (Unix seconds), when the IdP reported one
    pub expires_at: Option<u64>,
}

impl ActorToken {
    /// Token type URN sent as `actor_token_type`
    pub const TOKEN_TYPE: &'static str = "urn:ietf:params:oauth:token-type:access_token";

    /// Past its reported expiry
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| unix_now() >= exp)
    }
}

impl fmt::Debug for ActorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorToken")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Narrow token minted for one service by token exchange
#[derive(Clone)]
pub struct DelegatedToken {
    /// Service display name the token was minted for
    pub service: String,
    /// Bearer value
    pub token: String,
    /// Expiry (Unix seconds) as reported by the IdP
    pub expires_at: u64,
    /// Scopes granted, if the IdP reported them
    pub scope: Option<String>,
}

impl DelegatedToken {
    /// Usable with `margin` to spare; tokens inside the margin count as expired
    #[must_use]
    pub fn is_fresh(&self, margin: Duration) -> bool {
        unix_now() + margin.as_secs() < self.expires_at
    }

    /// `Authorization` header value
    #[must_use]
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// Claims read from the token without verification
    #[must_use]
    pub fn claims(&self) -> Option<TokenClaims> {
        decode_unverified(&self.token)
    }
}

impl fmt::Debug for DelegatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegatedToken")
            .field("service", &self.service)
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}
