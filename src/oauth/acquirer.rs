//! Interactive credential acquisition
//!
//! Owns the master token. [`CredentialAcquirer::authenticate`] returns the
//! cached token while it is valid (with the configured expiry buffer), tries a
//! refresh grant when it is not, and only then runs the interactive flow.
//! Concurrent callers share one attempt.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::actor::ActorTokenMinter;
use super::auth_code::{AuthorizationCodeFlow, RequestedActor};
use super::browser::BrowserLauncher;
use super::device::DeviceFlow;
use super::endpoint::{ClientAuth, TokenEndpoint};
use super::token::{MasterToken, ServiceIdentity};
use crate::config::{Config, LoginFlow};
use crate::{Error, Result};

/// The interactive flow used to obtain a master token
pub enum LoginStrategy {
    /// Authorization code + PKCE
    AuthorizationCode(AuthorizationCodeFlow),
    /// Device authorization grant
    Device(DeviceFlow),
}

impl LoginStrategy {
    /// Flow name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AuthorizationCode(_) => "authorization_code",
            Self::Device(_) => "device",
        }
    }
}

/// Acquires and caches the master token
pub struct CredentialAcquirer {
    strategy: LoginStrategy,
    token_endpoint: TokenEndpoint,
    client_id: String,
    client_secret: Option<String>,
    expiry_buffer: Duration,
    cached: Mutex<Option<MasterToken>>,
}

impl CredentialAcquirer {
    /// Create an acquirer
    pub fn new(
        strategy: LoginStrategy,
        token_endpoint: TokenEndpoint,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        expiry_buffer: Duration,
    ) -> Self {
        Self {
            strategy,
            token_endpoint,
            client_id: client_id.into(),
            client_secret,
            expiry_buffer,
            cached: Mutex::new(None),
        }
    }

    /// Build from configuration.
    ///
    /// `actor` is the resolved identity of `login.requested_actor`, if any.
    pub fn from_config(
        config: &Config,
        http: Client,
        browser: Arc<dyn BrowserLauncher>,
        actor: Option<ServiceIdentity>,
    ) -> Result<Self> {
        let login = &config.login;
        let idp = &config.idp;
        let client_id = login.client_id()?.to_string();
        let token_endpoint = TokenEndpoint::new(http.clone(), idp.token_url()?);

        let strategy = match login.flow {
            LoginFlow::AuthorizationCode => {
                let actor = actor.map(|identity| RequestedActor {
                    identity,
                    minter: ActorTokenMinter::new(
                        token_endpoint.clone(),
                        config.exchange.actor_scope.clone(),
                    ),
                });
                LoginStrategy::AuthorizationCode(
                    AuthorizationCodeFlow::new(
                        token_endpoint.clone(),
                        idp.authorize_url()?,
                        client_id.clone(),
                        login.client_secret()?,
                        login.scope.clone(),
                        login.redirect_uri.clone(),
                        login.callback_timeout,
                        browser,
                    )
                    .with_resource(idp.api_resource().map(str::to_string))
                    .with_actor(actor),
                )
            }
            LoginFlow::Device => LoginStrategy::Device(DeviceFlow::new(
                TokenEndpoint::new(http, idp.device_authorize_url()?),
                token_endpoint.clone(),
                client_id.clone(),
                login.client_secret().ok().map(str::to_string),
                login.scope.clone(),
                login.device_timeout,
                browser,
            )),
        };

        Ok(Self::new(
            strategy,
            token_endpoint,
            client_id,
            login.client_secret().ok().map(str::to_string),
            login.expiry_buffer,
        ))
    }

    /// Obtain a valid master token.
    ///
    /// Idempotent while the cached token is valid: no IdP calls are made.
    pub async fn authenticate(&self) -> Result<MasterToken> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.is_valid(self.expiry_buffer) {
                debug!("Using cached master token");
                return Ok(token.clone());
            }
        }

        let refresh_token = cached.as_ref().and_then(|t| t.refresh_token.clone());
        if let Some(refresh_token) = refresh_token {
            match self.refresh(&refresh_token).await {
                Ok(token) => {
                    *cached = Some(token.clone());
                    return Ok(token);
                }
                Err(e) => warn!(error = %e, "Master token refresh failed, signing in again"),
            }
        }

        info!(flow = self.strategy.name(), "Starting interactive sign-in");
        let response = match &self.strategy {
            LoginStrategy::AuthorizationCode(flow) => flow.run().await?,
            LoginStrategy::Device(flow) => flow.run().await?,
        };

        let token = MasterToken::from_response(response);
        info!(
            subject = token.subject().unwrap_or("-"),
            scope = token.scope.as_deref().unwrap_or("-"),
            expires_in = token.time_until_expiry().map_or(0, |d| d.as_secs()),
            "Master token acquired"
        );
        *cached = Some(token.clone());
        Ok(token)
    }

    /// The cached master token, if still valid. Never touches the network.
    pub async fn cached(&self) -> Option<MasterToken> {
        self.cached
            .lock()
            .await
            .as_ref()
            .filter(|t| t.is_valid(self.expiry_buffer))
            .cloned()
    }

    /// Seed the cache, e.g. with a token obtained out of band
    pub async fn store(&self, token: MasterToken) {
        *self.cached.lock().await = Some(token);
    }

    /// Drop the cached master token
    pub async fn invalidate(&self) {
        *self.cached.lock().await = None;
    }

    async fn refresh(&self, refresh_token: &str) -> Result<MasterToken> {
        let form = [("grant_type", "refresh_token"), ("refresh_token", refresh_token)];
        let auth = match self.client_secret.as_deref() {
            Some(secret) => ClientAuth::Basic {
                client_id: &self.client_id,
                client_secret: secret,
            },
            None => ClientAuth::Public {
                client_id: &self.client_id,
            },
        };

        let response = self
            .token_endpoint
            .request(&form, auth)
            .await
            .map_err(|e| e.into_interactive("refresh grant rejected"))?;

        let mut token = MasterToken::from_response(response);
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        info!("Master token refreshed");
        Ok(token)
    }

    /// Fail with [`Error::MasterTokenExpired`] unless a valid token is cached
    pub async fn require_cached(&self) -> Result<MasterToken> {
        self.cached().await.ok_or(Error::MasterTokenExpired)
    }
}
