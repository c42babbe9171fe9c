//! Authorization code + PKCE flow with a local callback listener

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};
use url::Url;

use super::actor::ActorTokenMinter;
use super::browser::{BrowserLauncher, present};
use super::callback::CallbackListener;
use super::endpoint::{ClientAuth, TokenEndpoint, TokenResponse};
use super::pkce::{PkcePair, generate_state};
use super::token::{ActorToken, ServiceIdentity};
use crate::{Error, Result};

/// The delegate named in `requested_actor`, with the means to prove it
#[derive(Debug, Clone)]
pub struct RequestedActor {
    /// The delegate service
    pub identity: ServiceIdentity,
    /// Mints the delegate's actor token for the code exchange
    pub minter: ActorTokenMinter,
}

/// Authorization code flow driver
pub struct AuthorizationCodeFlow {
    endpoint: TokenEndpoint,
    authorize_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    redirect_uri: String,
    resource: Option<String>,
    actor: Option<RequestedActor>,
    callback_timeout: Duration,
    browser: Arc<dyn BrowserLauncher>,
}

impl AuthorizationCodeFlow {
    /// Create a flow
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: TokenEndpoint,
        authorize_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        scope: impl Into<String>,
        redirect_uri: impl Into<String>,
        callback_timeout: Duration,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            endpoint,
            authorize_url: authorize_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            scope: scope.into(),
            redirect_uri: redirect_uri.into(),
            resource: None,
            actor: None,
            callback_timeout,
            browser,
        }
    }

    /// Bind issued tokens to an API resource (`resource` parameter)
    #[must_use]
    pub fn with_resource(mut self, resource: Option<String>) -> Self {
        self.resource = resource;
        self
    }

    /// Request delegation to `actor` (`requested_actor` parameter)
    #[must_use]
    pub fn with_actor(mut self, actor: Option<RequestedActor>) -> Self {
        self.actor = actor;
        self
    }

    /// Run the flow to completion
    pub async fn run(&self) -> Result<TokenResponse> {
        // The actor token must be in hand before the code arrives
        let actor_token = match &self.actor {
            Some(actor) => Some(actor.minter.mint(&actor.identity).await?),
            None => None,
        };

        let pkce = PkcePair::generate();
        let state = generate_state();

        let listener = CallbackListener::bind(&self.redirect_uri).await?;
        let redirect_uri = listener.redirect_uri().to_string();

        let url = self.authorization_url(&redirect_uri, &state, &pkce)?;
        debug!(url = %url, "Authorization URL built");
        present(self.browser.as_ref(), url.as_str());

        let callback = listener.wait(state, self.callback_timeout).await?;
        info!("Authorization code received");

        self.exchange_code(&callback.code, &redirect_uri, &pkce, actor_token.as_ref())
            .await
    }

    /// Build the authorization URL
    pub fn authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        pkce: &PkcePair,
    ) -> Result<Url> {
        let mut url = Url::parse(&self.authorize_url).map_err(|e| {
            Error::Config(format!("invalid authorize_url '{}': {e}", self.authorize_url))
        })?;

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &self.scope)
                .append_pair("state", state)
                .append_pair("code_challenge", &pkce.challenge)
                .append_pair("code_challenge_method", PkcePair::METHOD);
            if let Some(actor) = &self.actor {
                query.append_pair("requested_actor", &actor.identity.client_id);
            }
            if let Some(resource) = &self.resource {
                query.append_pair("resource", resource);
            }
        }

        Ok(url)
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        pkce: &PkcePair,
        actor_token: Option<&ActorToken>,
    ) -> Result<TokenResponse> {
        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", pkce.verifier.as_str()),
        ];
        if let Some(resource) = &self.resource {
            form.push(("resource", resource.as_str()));
        }
        if let Some(actor) = actor_token {
            form.push(("actor_token", actor.token.as_str()));
            form.push(("actor_token_type", ActorToken::TOKEN_TYPE));
        }

        self.endpoint
            .request(
                &form,
                ClientAuth::Basic {
                    client_id: &self.client_id,
                    client_secret: &self.client_secret,
                },
            )
            .await
            .map_err(|e| e.into_interactive("authorization code exchange failed"))
    }
}
