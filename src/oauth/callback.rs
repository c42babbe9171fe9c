//! Single-shot OAuth callback listener
//!
//! Binds the redirect URI's host and port, serves exactly one redirect, and
//! shuts down. The listener is bound before the browser is opened so the
//! redirect can never race the bind.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
};
use parking_lot::Mutex;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::{Error, Result};

/// How long a finished listener may take to drain before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Redirect query parameters
#[derive(Default, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,
    /// Echoed `state`
    pub state: Option<String>,
    /// IdP error code
    pub error: Option<String>,
    /// IdP error description
    pub error_description: Option<String>,
}

/// A captured authorization code
#[derive(Debug)]
pub struct CallbackResult {
    /// Authorization code
    pub code: String,
}

struct CallbackState {
    expected_state: String,
    tx: Mutex<Option<oneshot::Sender<Result<CallbackResult>>>>,
}

/// A bound, not yet serving, callback listener
pub struct CallbackListener {
    listener: TcpListener,
    redirect_uri: String,
    path: String,
}

impl CallbackListener {
    /// Bind the host and port named by `redirect_uri`.
    ///
    /// Port `0` binds an ephemeral port and rewrites the redirect URI to match.
    pub async fn bind(redirect_uri: &str) -> Result<Self> {
        let mut url = Url::parse(redirect_uri)
            .map_err(|e| Error::Config(format!("invalid redirect_uri '{redirect_uri}': {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("redirect_uri '{redirect_uri}' has no host")))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| {
                Error::InteractiveAuth(format!(
                    "failed to bind callback listener on {host}:{port}: {e}"
                ))
            })?;
        let local = listener.local_addr()?;

        if port == 0 {
            url.set_port(Some(local.port()))
                .map_err(|()| Error::Config(format!("cannot set port on '{redirect_uri}'")))?;
        }

        let path = match url.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };

        debug!(addr = %local, path = %path, "Callback listener bound");
        Ok(Self {
            listener,
            redirect_uri: url.to_string(),
            path,
        })
    }

    /// Redirect URI to send in the authorization request
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until one redirect arrives or `timeout` elapses.
    ///
    /// The listener is closed on every exit path.
    pub async fn wait(self, expected_state: String, timeout: Duration) -> Result<CallbackResult> {
        let Self {
            listener,
            redirect_uri,
            path,
        } = self;
        let (tx, rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(CallbackState {
            expected_state,
            tx: Mutex::new(Some(tx)),
        });

        let app = Router::new()
            .route(&path, get(handle_callback))
            .with_state(state);

        info!(url = %redirect_uri, "Waiting for authorization callback");

        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        let outcome = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Internal("callback channel closed".to_string())),
            Err(_) => Err(Error::InteractiveAuth(format!(
                "timed out after {}s waiting for the authorization callback",
                timeout.as_secs()
            ))),
        };

        let _ = shutdown_tx.send(());
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
            warn!("Callback listener did not drain in time, aborting");
            server.abort();
            let _ = server.await;
        }

        outcome
    }
}

async fn handle_callback(
    State(state): State<Arc<CallbackState>>,
    Query(params): Query<CallbackParams>,
) -> impl IntoResponse {
    debug!(
        has_code = params.code.is_some(),
        has_error = params.error.is_some(),
        "Received authorization callback"
    );

    let Some(tx) = state.tx.lock().take() else {
        return (
            StatusCode::GONE,
            Html(error_page("already_used", "This sign-in attempt has already completed.")),
        );
    };

    let (outcome, status, page) = evaluate(&state.expected_state, params);
    let _ = tx.send(outcome);
    (status, Html(page))
}

fn evaluate(
    expected_state: &str,
    params: CallbackParams,
) -> (Result<CallbackResult>, StatusCode, String) {
    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "no description".to_string());
        let page = error_page(&error, &description);
        return (
            Err(Error::InteractiveAuth(format!(
                "authorization server returned {error}: {description}"
            ))),
            StatusCode::BAD_REQUEST,
            page,
        );
    }

    let received_state = params.state.unwrap_or_default();
    let state_ok: bool = received_state
        .as_bytes()
        .ct_eq(expected_state.as_bytes())
        .into();
    if !state_ok {
        return (
            Err(Error::InteractiveAuth(
                "state mismatch in authorization callback".to_string(),
            )),
            StatusCode::BAD_REQUEST,
            error_page("state_mismatch", "The sign-in response did not match this request."),
        );
    }

    match params.code.filter(|c| !c.is_empty()) {
        Some(code) => (Ok(CallbackResult { code }), StatusCode::OK, success_page()),
        None => (
            Err(Error::InteractiveAuth(
                "authorization callback is missing the code".to_string(),
            )),
            StatusCode::BAD_REQUEST,
            error_page("missing_code", "No authorization code was returned."),
        ),
    }
}

const PAGE_STYLE: &str =
    "body{font-family:system-ui,sans-serif;max-width:32rem;margin:4rem auto;text-align:center}";

fn success_page() -> String {
    format!(
        "<!DOCTYPE html><html><head><title>Signed in</title><style>{PAGE_STYLE}</style></head>\
         <body><h1>Signed in</h1>\
         <p>You can close this window and return to the terminal.</p></body></html>"
    )
}

fn error_page(error: &str, description: &str) -> String {
    let error = escape(error);
    let description = escape(description);
    format!(
        "<!DOCTYPE html><html><head><title>Sign-in failed</title><style>{PAGE_STYLE}</style></head>\
         <body><h1>Sign-in failed</h1><p>{description}</p><p><code>{error}</code></p></body></html>"
    )
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
