//! Agent Delegation Library
//!
//! Delegates one user sign-in to many independent services, each receiving a
//! token narrowed to itself.
//!
//! # Features
//!
//! - **Interactive sign-in**: authorization code + PKCE with a local callback
//!   listener, or the device authorization grant
//! - **Token exchange**: RFC 8693 exchange per service, authenticated as the
//!   service and carrying its actor token, with a per-service cache
//! - **Bearer verification**: axum middleware backed by a per-issuer JWKS cache
//!   with stale fallback and multi-audience rules
//! - **Discovery**: agent-card fetching and pluggable credential resolution

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod delegation;
pub mod discovery;
pub mod error;
pub mod oauth;
pub mod service;
pub mod verifier;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string())),
    }
}
