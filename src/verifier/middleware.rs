//! Axum middleware guarding protected routes
//!
//! Per request: public path → allowed; no `Authorization` → 401
//! `unauthorized`; not `Bearer <token>` → 401 `invalid_request`; token fails
//! verification → 401 `invalid_token`; keys unavailable → 500
//! `server_error`. Verified claims are inserted into the request extensions.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, error, warn};

use super::bearer::BearerVerifier;

/// Shared middleware state
pub struct VerifierState {
    verifier: Option<Arc<BearerVerifier>>,
    public_paths: Vec<String>,
}

impl VerifierState {
    /// Verification on, with the given public paths
    #[must_use]
    pub fn enabled(verifier: Arc<BearerVerifier>, public_paths: Vec<String>) -> Self {
        Self {
            verifier: Some(verifier),
            public_paths,
        }
    }

    /// Verification off. For local development only; logged loudly.
    #[must_use]
    pub fn disabled() -> Self {
        warn!("Bearer token verification is DISABLED; every request is let through");
        Self {
            verifier: None,
            public_paths: Vec::new(),
        }
    }

    /// Whether requests are verified
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.verifier.is_some()
    }

    /// Check if a path bypasses verification
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        is_public_path(&self.public_paths, path)
    }
}

/// Match `path` against an allowlist.
///
/// Entries ending in `*` are prefixes; other entries match exactly or as a
/// parent segment (`/health` matches `/health/live`, not `/healthz`).
#[must_use]
pub fn is_public_path(public_paths: &[String], path: &str) -> bool {
    public_paths.iter().any(|p| match p.strip_suffix('*') {
        Some(prefix) => path.starts_with(prefix),
        None => {
            path == p
                || path
                    .strip_prefix(p.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        }
    })
}

/// Bearer verification middleware
pub async fn bearer_auth(
    State(state): State<Arc<VerifierState>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let Some(verifier) = state.verifier.as_ref() else {
        return next.run(request).await;
    };

    let path = request.uri().path().to_string();
    if state.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping verification");
        return next.run(request).await;
    }

    let Some(value) = request.headers().get(header::AUTHORIZATION) else {
        warn!(path = %path, "Missing Authorization header");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Missing authentication token",
        );
    };

    let Some(token) = value.to_str().ok().and_then(parse_bearer) else {
        warn!(path = %path, "Malformed Authorization header");
        return error_response(
            StatusCode::UNAUTHORIZED,
            "invalid_request",
            "Invalid Authorization header format. Expected: Bearer <token>",
        );
    };

    match verifier.verify(token).await {
        Ok(claims) => {
            debug!(
                path = %path,
                sub = claims.subject().unwrap_or("-"),
                "Authenticated request"
            );
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) if e.is_server_error() => {
            error!(path = %path, error = %e, "Token verification unavailable");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "server_error",
                "Token validation failed due to server error",
            )
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Invalid token");
            error_response(
                StatusCode::UNAUTHORIZED,
                "invalid_token",
                &format!("Token validation failed: {e}"),
            )
        }
    }
}

/// `Bearer <token>`, scheme case-insensitive, exactly two parts
fn parse_bearer(value: &str) -> Option<&str> {
    let mut parts = value.split_whitespace();
    let (scheme, token) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token)
}

fn error_response(status: StatusCode, error: &str, description: &str) -> Response {
    let challenge = if status == StatusCode::UNAUTHORIZED {
        format!("Bearer error=\"{error}\"")
    } else {
        "Bearer".to_string()
    };
    (
        status,
        [(header::WWW_AUTHENTICATE, challenge)],
        Json(json!({
            "error": error,
            "error_description": description,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(p: &[&str]) -> Vec<String> {
        p.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn public_path_matching() {
        let public = paths(&["/.well-known/agent-card.json", "/health", "/docs/*"]);
        assert!(is_public_path(&public, "/.well-known/agent-card.json"));
        assert!(is_public_path(&public, "/health"));
        assert!(is_public_path(&public, "/health/live"));
        assert!(!is_public_path(&public, "/healthz"));
        assert!(is_public_path(&public, "/docs/"));
        assert!(is_public_path(&public, "/docs/index.html"));
        assert!(!is_public_path(&public, "/"));
        assert!(!is_public_path(&public, "/tasks"));
    }

    #[test]
    fn bearer_header_parsing() {
        assert_eq!(parse_bearer("Bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("bearer abc"), Some("abc"));
        assert_eq!(parse_bearer("Basic abc"), None);
        assert_eq!(parse_bearer("Bearer"), None);
        assert_eq!(parse_bearer("Bearer a b"), None);
        assert_eq!(parse_bearer(""), None);
    }
}
