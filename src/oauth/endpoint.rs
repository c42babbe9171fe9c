//! Token endpoint plumbing shared by every grant
//!
//! All grants POST an `application/x-www-form-urlencoded` body and get back
//! either a token response or an OAuth error object (RFC 6749 §5.2).

use std::fmt;

use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// RFC 8693 grant type
pub const GRANT_TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
/// RFC 8628 grant type
pub const GRANT_DEVICE_CODE: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// Token type URN for JWT subject tokens
pub const TOKEN_TYPE_JWT: &str = "urn:ietf:params:oauth:token-type:jwt";
/// Token type URN for access tokens
pub const TOKEN_TYPE_ACCESS_TOKEN: &str = "urn:ietf:params:oauth:token-type:access_token";

/// Successful token response
#[derive(Clone, Deserialize)]
pub struct TokenResponse {
    /// Issued token
    pub access_token: String,
    /// Token type (usually `Bearer`)
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    /// OIDC ID token
    #[serde(default)]
    pub id_token: Option<String>,
}

impl fmt::Debug for TokenResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenResponse")
            .field("access_token", &"[redacted]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// OAuth error object
#[derive(Debug, Clone, Deserialize)]
struct OAuthErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Failure of a single token-endpoint request
#[derive(Debug, thiserror::Error)]
pub enum GrantError {
    /// The endpoint answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// OAuth `error` code, when the body was an OAuth error object
        error: Option<String>,
        /// OAuth `error_description`
        description: Option<String>,
        /// Raw response body
        body: String,
    },

    /// The endpoint answered 2xx with a body we could not parse
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The endpoint could not be reached
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl GrantError {
    /// OAuth `error` code of a rejection
    #[must_use]
    pub fn error_code(&self) -> Option<&str> {
        match self {
            Self::Rejected { error, .. } => error.as_deref(),
            _ => None,
        }
    }

    /// HTTP status of a rejection
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `error: description` if available, otherwise the raw message
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Rejected {
                error: Some(error),
                description,
                ..
            } => match description {
                Some(d) => format!("{error}: {d}"),
                None => error.clone(),
            },
            other => other.to_string(),
        }
    }

    /// Map into the crate taxonomy as a failed interactive login step
    pub(crate) fn into_interactive(self, step: &str) -> crate::Error {
        match self {
            Self::Transport(e) => crate::Error::Transport(e),
            other => crate::Error::InteractiveAuth(format!("{step}: {}", other.summary())),
        }
    }
}

/// How the client authenticates to the endpoint
#[derive(Clone, Copy)]
pub enum ClientAuth<'a> {
    /// HTTP Basic with client id and secret
    Basic {
        /// Client id
        client_id: &'a str,
        /// Client secret
        client_secret: &'a str,
    },
    /// `client_id` in the form body only (public client)
    Public {
        /// Client id
        client_id: &'a str,
    },
}

/// A form-POST OAuth endpoint
#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    http: Client,
    url: String,
}

impl TokenEndpoint {
    /// Create an endpoint client
    pub fn new(http: Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    /// Endpoint URL
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request a token
    pub async fn request(
        &self,
        form: &[(&str, &str)],
        auth: ClientAuth<'_>,
    ) -> Result<TokenResponse, GrantError> {
        self.post(form, auth).await
    }

    /// POST a form and decode a JSON success body
    pub async fn post<T: DeserializeOwned>(
        &self,
        form: &[(&str, &str)],
        auth: ClientAuth<'_>,
    ) -> Result<T, GrantError> {
        let mut fields: Vec<(&str, &str)> = form.to_vec();
        let mut request = self.http.post(&self.url).header("Accept", "application/json");

        match auth {
            ClientAuth::Basic {
                client_id,
                client_secret,
            } => {
                request = request.basic_auth(client_id, Some(client_secret));
            }
            ClientAuth::Public { client_id } => {
                if !fields.iter().any(|(k, _)| *k == "client_id") {
                    fields.push(("client_id", client_id));
                }
            }
        }

        let grant = fields
            .iter()
            .find(|(k, _)| *k == "grant_type")
            .map_or("-", |(_, v)| *v);
        debug!(url = %self.url, grant, "POST token endpoint");

        let response = request.form(&fields).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let parsed = serde_json::from_str::<OAuthErrorBody>(&body).ok();
            return Err(GrantError::Rejected {
                status: status.as_u16(),
                error: parsed.as_ref().map(|e| e.error.clone()),
                description: parsed.and_then(|e| e.error_description),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| GrantError::Malformed(e.to_string()))
    }
}
