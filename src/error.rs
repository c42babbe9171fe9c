//! Error types for agent delegation

use std::io;

use thiserror::Error;

use crate::verifier::VerificationError;

/// Result type alias for agent delegation
pub type Result<T> = std::result::Result<T, Error>;

/// Agent delegation errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or placeholder configuration (credentials, endpoints)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Interactive login failed (consent denied, callback timeout, malformed redirect)
    #[error("Interactive authentication failed: {0}")]
    InteractiveAuth(String),

    /// The identity provider rejected a token exchange for one service
    #[error("Token exchange failed for {service}: {message}")]
    Exchange {
        /// Service display name
        service: String,
        /// IdP error body or failure reason
        message: String,
    },

    /// Inbound bearer token rejected
    #[error("Token verification failed: {0}")]
    Verification(#[from] VerificationError),

    /// Network failure talking to the IdP or a downstream service
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// No valid master token is available for delegation
    #[error("Master token is missing or expired; authenticate first")]
    MasterTokenExpired,

    /// Service not present in the discovery registry
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Service was discovered but has no usable delegation credentials
    #[error("Delegation unavailable for {service}: {reason}")]
    DelegationUnavailable {
        /// Service display name
        service: String,
        /// Why delegation cannot be performed
        reason: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an exchange error attributed to a single service
    pub fn exchange(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Exchange {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether the caller may retry the failed operation from scratch.
    ///
    /// Configuration problems need operator action; everything else is
    /// scoped to a single attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Config(_) | Self::ServiceNotFound(_) | Self::DelegationUnavailable { .. }
        )
    }
}
