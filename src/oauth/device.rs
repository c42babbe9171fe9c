//! Device authorization grant (RFC 8628)

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::browser::{BrowserLauncher, present};
use super::endpoint::{ClientAuth, GRANT_DEVICE_CODE, GrantError, TokenEndpoint, TokenResponse};
use crate::{Error, Result};

/// Interval used when the server does not specify one
const DEFAULT_INTERVAL_SECS: u64 = 5;

/// Floor for a server-sent interval, so `0` cannot spin the poll loop
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Added to the interval on every `slow_down`
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

/// Device-authorization response
#[derive(Clone, Deserialize)]
pub struct DeviceAuthorization {
    /// Code the client polls with
    pub device_code: String,
    /// Code the user types in
    pub user_code: String,
    /// Where the user goes
    pub verification_uri: String,
    /// Verification URL with the user code filled in
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    /// Lifetime of the device code
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Minimum polling interval in seconds
    #[serde(default)]
    pub interval: Option<u64>,
}

impl DeviceAuthorization {
    /// Polling interval: the server's value, at least one second
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval.unwrap_or(DEFAULT_INTERVAL_SECS)).max(MIN_INTERVAL)
    }
}

/// Device flow driver
pub struct DeviceFlow {
    device_endpoint: TokenEndpoint,
    token_endpoint: TokenEndpoint,
    client_id: String,
    client_secret: Option<String>,
    scope: String,
    timeout: Duration,
    browser: Arc<dyn BrowserLauncher>,
}

impl DeviceFlow {
    /// Create a device flow
    pub fn new(
        device_endpoint: TokenEndpoint,
        token_endpoint: TokenEndpoint,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        scope: impl Into<String>,
        timeout: Duration,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            device_endpoint,
            token_endpoint,
            client_id: client_id.into(),
            client_secret,
            scope: scope.into(),
            timeout,
            browser,
        }
    }

    /// Run the flow to completion
    pub async fn run(&self) -> Result<TokenResponse> {
        let authorization = self.request_device_code().await?;
        self.prompt(&authorization);
        self.poll(&authorization).await
    }

    /// Request a device/user code pair.
    ///
    /// Tries a public-client request first and retries once with Basic auth
    /// if the server answers 400 or 401 and a secret is configured.
    pub async fn request_device_code(&self) -> Result<DeviceAuthorization> {
        let form = [("scope", self.scope.as_str())];
        let public = ClientAuth::Public {
            client_id: &self.client_id,
        };

        match self.device_endpoint.post(&form, public).await {
            Ok(auth) => Ok(auth),
            Err(e) if matches!(e.status(), Some(400 | 401)) => {
                let Some(secret) = self.client_secret.as_deref() else {
                    return Err(e.into_interactive("device authorization rejected"));
                };
                debug!(status = ?e.status(), "Retrying device authorization with Basic auth");
                let form = [("client_id", self.client_id.as_str()), ("scope", self.scope.as_str())];
                self.device_endpoint
                    .post(
                        &form,
                        ClientAuth::Basic {
                            client_id: &self.client_id,
                            client_secret: secret,
                        },
                    )
                    .await
                    .map_err(|e| e.into_interactive("device authorization rejected"))
            }
            Err(e) => Err(e.into_interactive("device authorization failed")),
        }
    }

    fn prompt(&self, authorization: &DeviceAuthorization) {
        println!("\nTo sign in, visit:\n  {}", authorization.verification_uri);
        println!("and enter the code:\n  {}\n", authorization.user_code);

        let url = authorization
            .verification_uri_complete
            .as_deref()
            .unwrap_or(&authorization.verification_uri);
        present(self.browser.as_ref(), url);
    }

    /// Poll the token endpoint until the user finishes, or the flow fails or
    /// times out
    pub async fn poll(&self, authorization: &DeviceAuthorization) -> Result<TokenResponse> {
        let interval = authorization.poll_interval();

        tokio::time::timeout(
            self.timeout,
            self.poll_loop(&authorization.device_code, interval),
        )
        .await
        .map_err(|_| {
            Error::InteractiveAuth(format!(
                "device sign-in not completed within {}s",
                self.timeout.as_secs()
            ))
        })?
    }

    async fn poll_loop(&self, device_code: &str, mut interval: Duration) -> Result<TokenResponse> {
        let form = [("grant_type", GRANT_DEVICE_CODE), ("device_code", device_code)];
        let auth = match self.client_secret.as_deref() {
            Some(secret) => ClientAuth::Basic {
                client_id: &self.client_id,
                client_secret: secret,
            },
            None => ClientAuth::Public {
                client_id: &self.client_id,
            },
        };

        info!("Waiting for device sign-in");
        let mut polls = 0u32;
        loop {
            polls += 1;
            match self.token_endpoint.request(&form, auth).await {
                Ok(token) => {
                    info!(polls, "Device sign-in completed");
                    return Ok(token);
                }
                Err(e) => match PollStatus::from(&e) {
                    PollStatus::Pending => debug!(polls, "authorization_pending"),
                    PollStatus::SlowDown => {
                        interval += SLOW_DOWN_STEP;
                        warn!(interval_secs = interval.as_secs(), "Server asked to slow down");
                    }
                    PollStatus::Expired => {
                        return Err(Error::InteractiveAuth(
                            "device code expired before sign-in completed".to_string(),
                        ));
                    }
                    PollStatus::Denied => {
                        return Err(Error::InteractiveAuth(
                            "user denied the authorization request".to_string(),
                        ));
                    }
                    PollStatus::Failed => {
                        return Err(e.into_interactive("device token poll failed"));
                    }
                },
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Outcome of one poll that did not yield a token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollStatus {
    Pending,
    SlowDown,
    Expired,
    Denied,
    Failed,
}

impl From<&GrantError> for PollStatus {
    fn from(e: &GrantError) -> Self {
        match e.error_code() {
            Some("authorization_pending") => Self::Pending,
            Some("slow_down") => Self::SlowDown,
            Some("expired_token") => Self::Expired,
            Some("access_denied") => Self::Denied,
            _ => Self::Failed,
        }
    }
}
