//! RFC 8693 token exchange
//!
//! Narrows the master token to one service. The request is authenticated as
//! the *service* so the issued token's audience is the service, and carries
//! the service's actor token. Results are cached per service name.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use reqwest::Client;
use tracing::{debug, info, warn};

use super::actor::ActorTokenMinter;
use super::claims::decode_unverified;
use super::endpoint::{
    ClientAuth, GRANT_TOKEN_EXCHANGE, GrantError, TOKEN_TYPE_ACCESS_TOKEN, TOKEN_TYPE_JWT,
    TokenEndpoint,
};
use super::token::{ActorToken, DelegatedToken, MasterToken, ServiceIdentity, unix_now};
use crate::config::Config;
use crate::{Error, Result};

/// Lifetime assumed when the response reports none
const DEFAULT_EXPIRES_IN: u64 = 3600;

/// Exchanges master tokens for per-service delegated tokens
pub struct TokenExchanger {
    endpoint: TokenEndpoint,
    minter: ActorTokenMinter,
    api_resource: Option<String>,
    safety_margin: Duration,
    cache: DashMap<String, DelegatedToken>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenExchanger {
    /// Create an exchanger
    pub fn new(
        endpoint: TokenEndpoint,
        minter: ActorTokenMinter,
        api_resource: Option<String>,
        safety_margin: Duration,
    ) -> Self {
        Self {
            endpoint,
            minter,
            api_resource,
            safety_margin,
            cache: DashMap::new(),
            inflight: DashMap::new(),
        }
    }

    /// Build from configuration
    pub fn from_config(config: &Config, http: Client) -> Result<Self> {
        let endpoint = TokenEndpoint::new(http, config.idp.token_exchange_url()?);
        let minter = ActorTokenMinter::new(endpoint.clone(), config.exchange.actor_scope.clone());
        Ok(Self::new(
            endpoint,
            minter,
            config.idp.api_resource().map(str::to_string),
            config.exchange.safety_margin,
        ))
    }

    /// Obtain a delegated token for `service`.
    ///
    /// A cached token with more than the safety margin left is returned
    /// without any network call. Failures are scoped to this service: neither
    /// the master token nor other services' cache entries are touched.
    pub async fn exchange(
        &self,
        master: &MasterToken,
        service: &ServiceIdentity,
    ) -> Result<DelegatedToken> {
        if let Some(token) = self.fresh(&service.name) {
            debug!(service = %service.name, "Using cached delegated token");
            return Ok(token);
        }

        let slot = self
            .inflight
            .entry(service.name.clone())
            .or_default()
            .clone();
        let _guard = slot.lock().await;

        // Another caller may have finished while we waited
        if let Some(token) = self.fresh(&service.name) {
            return Ok(token);
        }

        if master.is_expired() {
            return Err(Error::MasterTokenExpired);
        }

        let secret = service.secret()?;
        let actor = self.minter.mint(service).await?;
        let token = self.request(master, service, secret, &actor).await?;

        self.cache.insert(service.name.clone(), token.clone());
        Ok(token)
    }

    async fn request(
        &self,
        master: &MasterToken,
        service: &ServiceIdentity,
        secret: &str,
        actor: &ActorToken,
    ) -> Result<DelegatedToken> {
        let scope = self.qualified_scope(&service.required_scope);
        let mut form = vec![
            ("grant_type", GRANT_TOKEN_EXCHANGE),
            ("subject_token", master.access_token.as_str()),
            ("subject_token_type", TOKEN_TYPE_JWT),
            ("requested_token_type", TOKEN_TYPE_ACCESS_TOKEN),
            ("scope", scope.as_str()),
            ("actor_token", actor.token.as_str()),
            ("actor_token_type", ActorToken::TOKEN_TYPE),
        ];
        if let Some(resource) = &self.api_resource {
            form.push(("audience", resource.as_str()));
            form.push(("resource", resource.as_str()));
        }

        debug!(service = %service.name, scope = %scope, "Requesting token exchange");
        let response = self
            .endpoint
            .request(
                &form,
                ClientAuth::Basic {
                    client_id: &service.client_id,
                    client_secret: secret,
                },
            )
            .await
            .map_err(|e| match e {
                GrantError::Transport(t) => Error::Transport(t),
                GrantError::Rejected { body, status, .. } => {
                    warn!(service = %service.name, status, "Token exchange rejected");
                    Error::exchange(&service.name, body)
                }
                other @ GrantError::Malformed(_) => {
                    Error::exchange(&service.name, other.to_string())
                }
            })?;

        let expires_at = match response.expires_in {
            Some(secs) => unix_now() + secs,
            None => decode_unverified(&response.access_token)
                .and_then(|c| c.exp)
                .unwrap_or_else(|| unix_now() + DEFAULT_EXPIRES_IN),
        };

        info!(
            service = %service.name,
            scope = response.scope.as_deref().unwrap_or("-"),
            expires_in = expires_at.saturating_sub(unix_now()),
            "Delegated token issued"
        );
        Ok(DelegatedToken {
            service: service.name.clone(),
            token: response.access_token,
            expires_at,
            scope: response.scope,
        })
    }

    /// Scope sent on the exchange request.
    ///
    /// With an API-resource identifier each scope is qualified as `{id}/{scope}`
    /// and `openid` is prepended.
    #[must_use]
    pub fn qualified_scope(&self, required_scope: &str) -> String {
        match &self.api_resource {
            Some(id) => {
                let id = id.trim_end_matches('/');
                let mut scopes = vec!["openid".to_string()];
                scopes.extend(
                    required_scope
                        .split_whitespace()
                        .filter(|s| *s != "openid")
                        .map(|s| format!("{id}/{s}")),
                );
                scopes.join(" ")
            }
            None => required_scope.to_string(),
        }
    }

    fn fresh(&self, name: &str) -> Option<DelegatedToken> {
        let entry = self.cache.get(name)?;
        if entry.is_fresh(self.safety_margin) {
            return Some(entry.value().clone());
        }
        drop(entry);
        self.cache.remove_if(name, |_, t| !t.is_fresh(self.safety_margin));
        None
    }

    /// A cached, fresh token for `name` without exchanging
    #[must_use]
    pub fn cached(&self, name: &str) -> Option<DelegatedToken> {
        self.fresh(name)
    }

    /// Revoke the cached token for one service
    pub fn invalidate(&self, name: &str) {
        if self.cache.remove(name).is_some() {
            info!(service = %name, "Delegated token invalidated");
        }
    }

    /// Drop every cached delegated token
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
