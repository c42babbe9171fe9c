//! Delegated outbound calls
//!
//! [`DelegationContext`] ties the run's state together: the master token
//! owner, the exchanger with its per-service cache, and the registry built
//! during discovery. Every flow step receives it explicitly.

use std::sync::Arc;

use reqwest::{Client, StatusCode, header};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::discovery::AgentRegistry;
use crate::oauth::{CredentialAcquirer, DelegatedToken, TokenExchanger};
use crate::{Error, Result};

/// State shared by delegated calls in one run
pub struct DelegationContext {
    http: Client,
    acquirer: Arc<CredentialAcquirer>,
    exchanger: Arc<TokenExchanger>,
    registry: AgentRegistry,
}

impl DelegationContext {
    /// Create a context
    pub fn new(
        http: Client,
        acquirer: Arc<CredentialAcquirer>,
        exchanger: Arc<TokenExchanger>,
        registry: AgentRegistry,
    ) -> Self {
        Self {
            http,
            acquirer,
            exchanger,
            registry,
        }
    }

    /// Services known to this run
    #[must_use]
    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    /// The exchanger, for cache inspection
    #[must_use]
    pub fn exchanger(&self) -> &TokenExchanger {
        &self.exchanger
    }

    /// Delegated token for `service`, signing in first if needed
    pub async fn token_for(&self, service: &str) -> Result<DelegatedToken> {
        let identity = self.registry.identity(service)?;
        let master = self.acquirer.authenticate().await?;
        self.exchanger.exchange(&master, identity).await
    }

    /// POST `body` to `service` with a delegated token.
    ///
    /// A 401 from the service revokes the cached token; the call is retried
    /// once with a freshly exchanged one.
    pub async fn call(&self, service: &str, body: &Value) -> Result<Value> {
        let endpoint = self
            .registry
            .get(service)
            .and_then(|a| a.endpoint())
            .ok_or_else(|| Error::ServiceNotFound(service.to_string()))?
            .to_string();

        let token = self.token_for(service).await?;
        let response = self.send(&endpoint, &token, body).await?;

        let response = if response.status() == StatusCode::UNAUTHORIZED {
            warn!(service = %service, "Delegated token rejected, re-exchanging");
            self.exchanger.invalidate(service);
            let token = self.token_for(service).await?;
            self.send(&endpoint, &token, body).await?
        } else {
            response
        };

        let value = response.error_for_status()?.json::<Value>().await?;
        info!(service = %service, "Delegated call completed");
        Ok(value)
    }

    async fn send(
        &self,
        endpoint: &str,
        token: &DelegatedToken,
        body: &Value,
    ) -> Result<reqwest::Response> {
        debug!(url = %endpoint, service = %token.service, "Sending delegated request");
        let response = self
            .http
            .post(endpoint)
            .header(header::AUTHORIZATION, token.bearer())
            .json(body)
            .send()
            .await?;
        Ok(response)
    }
}
