//! Actor tokens: a service proving its own identity
//!
//! A client-credentials grant made with the service's own client id and
//! secret. The result is presented alongside a delegation request so the IdP
//! knows which service is the intended delegate.

use tracing::{debug, info};

use super::claims::decode_unverified;
use super::endpoint::{ClientAuth, GrantError, TokenEndpoint};
use super::token::{ActorToken, ServiceIdentity, unix_now};
use crate::{Error, Result};

/// Mints actor tokens via client credentials
#[derive(Debug, Clone)]
pub struct ActorTokenMinter {
    endpoint: TokenEndpoint,
    scope: String,
}

impl ActorTokenMinter {
    /// Create a minter requesting `scope` (normally just `openid`)
    pub fn new(endpoint: TokenEndpoint, scope: impl Into<String>) -> Self {
        Self {
            endpoint,
            scope: scope.into(),
        }
    }

    /// Obtain an actor token for `service`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the service has no usable secret, otherwise an
    /// exchange error attributed to the service.
    pub async fn mint(&self, service: &ServiceIdentity) -> Result<ActorToken> {
        let secret = service.secret()?;

        debug!(service = %service.name, client_id = %service.client_id, "Minting actor token");
        let response = self
            .endpoint
            .request(
                &[("grant_type", "client_credentials"), ("scope", self.scope.as_str())],
                ClientAuth::Basic {
                    client_id: &service.client_id,
                    client_secret: secret,
                },
            )
            .await
            .map_err(|e| match e {
                GrantError::Transport(t) => Error::Transport(t),
                other => Error::exchange(
                    &service.name,
                    format!("actor token request rejected: {other}"),
                ),
            })?;

        let expires_at = response
            .expires_in
            .map(|secs| unix_now() + secs)
            .or_else(|| decode_unverified(&response.access_token).and_then(|c| c.exp));

        info!(service = %service.name, "Actor token obtained");
        Ok(ActorToken {
            token: response.access_token,
            expires_at,
        })
    }
}
