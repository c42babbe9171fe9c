//! Protected service shim
//!
//! A minimal service behind the bearer verifier: the agent card and health
//! check are public, `POST /` requires a verified token and echoes who the
//! caller is.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::State,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info};

use crate::config::{AGENT_CARD_PATH, Config};
use crate::discovery::{AgentCard, AuthMetadata, CardMetadata};
use crate::verifier::{BearerVerifier, VerifiedClaims, VerifierState, bearer_auth};
use crate::{Error, Result};

/// Shared application state
pub struct ServiceState {
    /// Card served at the well-known path
    pub card: AgentCard,
    /// Bearer verification
    pub verifier: Arc<VerifierState>,
}

impl ServiceState {
    /// Build from configuration.
    ///
    /// With verification enabled, a missing issuer or JWKS URL is a
    /// configuration error rather than a silent downgrade.
    pub fn from_config(config: &Config, http: reqwest::Client) -> Result<Self> {
        let verifier = if config.verifier.enabled {
            let bearer = BearerVerifier::from_config(config, http)?;
            VerifierState::enabled(Arc::new(bearer), config.verifier.public_paths.clone())
        } else {
            VerifierState::disabled()
        };

        Ok(Self {
            card: agent_card(config),
            verifier: Arc::new(verifier),
        })
    }
}

/// The card this service publishes about itself
#[must_use]
pub fn agent_card(config: &Config) -> AgentCard {
    let server = &config.server;
    AgentCard {
        name: server.name.clone(),
        description: server.description.clone(),
        url: Some(format!("http://{}:{}/", server.host, server.port)),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        skills: Vec::new(),
        metadata: Some(CardMetadata {
            auth: Some(AuthMetadata {
                application_id: config.verifier.client_id.clone(),
                required_scope: server.required_scope.clone(),
                issuer: config.idp.issuer.clone(),
            }),
            extra: Default::default(),
        }),
    }
}

/// Create the router
pub fn create_router(state: Arc<ServiceState>) -> Router {
    let verifier = Arc::clone(&state.verifier);

    Router::new()
        .route(AGENT_CARD_PATH, get(card_handler))
        .route("/health", get(health_handler))
        .route("/", post(request_handler))
        .layer(middleware::from_fn_with_state(verifier, bearer_auth))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn card_handler(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    Json(state.card.clone())
}

async fn health_handler(State(state): State<Arc<ServiceState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": state.card.name,
        "auth_enabled": state.verifier.is_enabled(),
    }))
}

/// Echo the verified caller
async fn request_handler(
    claims: Option<Extension<VerifiedClaims>>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let caller = claims.as_ref().map(|Extension(c)| {
        json!({
            "subject": c.subject(),
            "client_id": c.client_id(),
            "scopes": c.scopes().collect::<Vec<_>>(),
        })
    });

    Json(json!({
        "caller": caller,
        "received": body,
    }))
}

/// Serve until SIGINT/SIGTERM
pub async fn run(config: &Config) -> Result<()> {
    let http = config.http_client()?;
    let state = Arc::new(ServiceState::from_config(config, http)?);
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| Error::Config(format!("invalid server address: {e}")))?;
    let listener = TcpListener::bind(addr).await?;

    info!(
        addr = %addr,
        name = %config.server.name,
        auth = config.verifier.enabled,
        "Service listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    info!("Service stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
