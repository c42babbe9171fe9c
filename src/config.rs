//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default local callback for the authorization-code flow
pub const DEFAULT_REDIRECT_URI: &str = "http://localhost:8080/callback";

/// Path of the public service self-description
pub const AGENT_CARD_PATH: &str = "/.well-known/agent-card.json";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Identity provider endpoints
    pub idp: IdpConfig,
    /// Interactive login (master token) settings
    pub login: LoginConfig,
    /// Token exchange settings
    pub exchange: ExchangeConfig,
    /// Explicit service credential registry, keyed by display name
    pub services: HashMap<String, ServiceConfig>,
    /// Base URLs of services to discover
    pub agents: Vec<String>,
    /// Inbound bearer verification
    pub verifier: VerifierConfig,
    /// Service shim (the `serve` subcommand)
    pub server: ServerConfig,
}

/// Identity provider endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// Authorization endpoint (authorization-code flow)
    pub authorize_url: Option<String>,
    /// Token endpoint
    pub token_url: Option<String>,
    /// Device-authorization endpoint
    pub device_authorize_url: Option<String>,
    /// Token-exchange endpoint (defaults to `token_url`)
    pub token_exchange_url: Option<String>,
    /// Expected `iss` of inbound tokens
    pub issuer: Option<String>,
    /// JWKS endpoint (defaults to `{issuer}/.well-known/jwks.json`)
    pub jwks_url: Option<String>,
    /// API-resource identifier used to qualify scopes and bind audiences
    pub api_resource_identifier: Option<String>,
    /// Per-request timeout for every outbound call (IdP, JWKS, services)
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            authorize_url: None,
            token_url: None,
            device_authorize_url: None,
            token_exchange_url: None,
            issuer: None,
            jwks_url: None,
            api_resource_identifier: None,
            http_timeout: Duration::from_secs(10),
        }
    }
}

impl IdpConfig {
    /// Token endpoint
    pub fn token_url(&self) -> Result<&str> {
        require(self.token_url.as_deref(), "idp.token_url")
    }

    /// Authorization endpoint
    pub fn authorize_url(&self) -> Result<&str> {
        require(self.authorize_url.as_deref(), "idp.authorize_url")
    }

    /// Device-authorization endpoint
    pub fn device_authorize_url(&self) -> Result<&str> {
        require(
            self.device_authorize_url.as_deref(),
            "idp.device_authorize_url",
        )
    }

    /// Token-exchange endpoint, falling back to the token endpoint
    pub fn token_exchange_url(&self) -> Result<&str> {
        match self.token_exchange_url.as_deref() {
            Some(url) if is_configured(url) => Ok(url),
            _ => self.token_url(),
        }
    }

    /// Expected issuer
    pub fn issuer(&self) -> Result<&str> {
        require(self.issuer.as_deref(), "idp.issuer")
    }

    /// JWKS endpoint, derived from the issuer when not set
    pub fn jwks_url(&self) -> Result<String> {
        match self.jwks_url.as_deref() {
            Some(url) if is_configured(url) => Ok(url.to_string()),
            _ => self.issuer().map(default_jwks_uri),
        }
    }

    /// API-resource identifier, if configured
    #[must_use]
    pub fn api_resource(&self) -> Option<&str> {
        self.api_resource_identifier
            .as_deref()
            .filter(|v| is_configured(v))
    }
}

/// Which interactive flow obtains the master token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoginFlow {
    /// Authorization code + PKCE with a local callback listener
    #[default]
    AuthorizationCode,
    /// Device authorization grant (RFC 8628)
    Device,
}

/// Interactive login configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    /// Flow to run
    pub flow: LoginFlow,
    /// Orchestrator client id
    pub client_id: Option<String>,
    /// Orchestrator client secret
    pub client_secret: Option<String>,
    /// Scopes requested for the master token
    pub scope: String,
    /// Redirect URI served by the local callback listener
    pub redirect_uri: String,
    /// Service name to name as `requested_actor` in the authorization request
    pub requested_actor: Option<String>,
    /// How long the callback listener waits for the browser redirect
    #[serde(with = "humantime_serde")]
    pub callback_timeout: Duration,
    /// Hard wall-clock limit for device-flow polling
    #[serde(with = "humantime_serde")]
    pub device_timeout: Duration,
    /// Treat the master token as expired this long before `exp`
    #[serde(with = "humantime_serde")]
    pub expiry_buffer: Duration,
    /// Open the system browser automatically
    pub open_browser: bool,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            flow: LoginFlow::default(),
            client_id: None,
            client_secret: None,
            scope: "openid profile".to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            requested_actor: None,
            callback_timeout: Duration::from_secs(300),
            device_timeout: Duration::from_secs(300),
            expiry_buffer: Duration::from_secs(300),
            open_browser: true,
        }
    }
}

impl LoginConfig {
    /// Orchestrator client id
    pub fn client_id(&self) -> Result<&str> {
        require(self.client_id.as_deref(), "login.client_id")
    }

    /// Orchestrator client secret
    pub fn client_secret(&self) -> Result<&str> {
        require(self.client_secret.as_deref(), "login.client_secret")
    }
}

/// Token exchange configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Delegated tokens are considered expired this long before they really expire
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
    /// Scope requested for actor tokens
    pub actor_scope: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            safety_margin: Duration::from_secs(60),
            actor_scope: "openid".to_string(),
        }
    }
}

/// Registered credentials for one downstream service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service client id (becomes the delegated token's audience)
    pub client_id: String,
    /// Service client secret (needed to mint actor tokens)
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Scope the service requires
    pub required_scope: String,
}

/// Inbound verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Verify bearer tokens. Disabling is for local development only.
    pub enabled: bool,
    /// This service's own client id (accepted audience)
    pub client_id: Option<String>,
    /// Additional accepted audiences
    pub audiences: Vec<String>,
    /// Paths that bypass verification. A trailing `*` marks a prefix.
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
    /// JWKS cache lifetime
    #[serde(with = "humantime_serde")]
    pub jwks_ttl: Duration,
    /// Force one JWKS refresh when a token's `kid` is unknown
    pub refresh_on_unknown_kid: bool,
    /// Minimum spacing between forced JWKS refreshes
    #[serde(with = "humantime_serde")]
    pub min_refresh_interval: Duration,
    /// Clock skew tolerance for `exp`/`nbf`
    #[serde(with = "humantime_serde")]
    pub leeway: Duration,
}

fn default_public_paths() -> Vec<String> {
    vec![AGENT_CARD_PATH.to_string(), "/health".to_string()]
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            client_id: None,
            audiences: Vec::new(),
            public_paths: default_public_paths(),
            jwks_ttl: Duration::from_secs(24 * 60 * 60),
            refresh_on_unknown_kid: true,
            min_refresh_interval: Duration::from_secs(5),
            leeway: Duration::from_secs(60),
        }
    }
}

impl VerifierConfig {
    /// Full accepted-audience set: own client id, extra audiences, API resource
    #[must_use]
    pub fn accepted_audiences(&self, idp: &IdpConfig) -> Vec<String> {
        let mut audiences: Vec<String> = Vec::new();
        let candidates = self
            .client_id
            .iter()
            .chain(self.audiences.iter())
            .map(String::as_str)
            .chain(idp.api_resource());

        for aud in candidates {
            if is_configured(aud) && !audiences.iter().any(|a| a == aud) {
                audiences.push(aud.to_string());
            }
        }
        audiences
    }
}

/// Service shim configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Display name published in the agent card
    pub name: String,
    /// Description published in the agent card
    pub description: String,
    /// Scope advertised in the agent card
    pub required_scope: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10005,
            name: "Delegated Service".to_string(),
            description: String::new(),
            required_scope: None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // AGENT_AUTH_IDP__TOKEN_URL -> idp.token_url
        figment = figment.merge(Env::prefixed("AGENT_AUTH_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must land before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// HTTP client shared by outbound calls, bounded by `idp.http_timeout`.
    ///
    /// A hung IdP then surfaces as a transport error instead of stalling
    /// sign-in, exchange, or JWKS refresh forever.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .timeout(self.idp.http_timeout)
            .build()?)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in endpoint and credential values
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        let idp = &mut self.idp;
        for value in [
            &mut idp.authorize_url,
            &mut idp.token_url,
            &mut idp.device_authorize_url,
            &mut idp.token_exchange_url,
            &mut idp.issuer,
            &mut idp.jwks_url,
            &mut idp.api_resource_identifier,
            &mut self.login.client_id,
            &mut self.login.client_secret,
            &mut self.verifier.client_id,
        ]
        .into_iter()
        .flatten()
        {
            *value = Self::expand_string(&re, value);
        }

        for service in self.services.values_mut() {
            service.client_id = Self::expand_string(&re, &service.client_id);
            if let Some(secret) = service.client_secret.as_mut() {
                *secret = Self::expand_string(&re, secret);
            }
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Whether a configured value is usable: non-empty and not a `<template>` placeholder
#[must_use]
pub fn is_configured(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !value.contains('<') && !value.contains('>')
}

fn require<'a>(value: Option<&'a str>, key: &str) -> Result<&'a str> {
    match value {
        Some(v) if is_configured(v) => Ok(v),
        Some(_) => Err(Error::Config(format!("{key} still holds a placeholder value"))),
        None => Err(Error::Config(format!("{key} is not configured"))),
    }
}

/// Derive the default JWKS URI from the issuer URL
fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}

/// Human-readable serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to a human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a duration string (e.g., "250ms", "30s", "5m", "24h")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string; bare numbers are seconds
    pub(crate) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        // "ms" must be checked before "s" and "m"
        let (number, unit_secs, millis) = if let Some(ms) = s.strip_suffix("ms") {
            (ms, 1, true)
        } else if let Some(secs) = s.strip_suffix('s') {
            (secs, 1, false)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60, false)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600, false)
        } else {
            (s, 1, false)
        };

        let value = number
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;
        if millis {
            return Ok(Duration::from_millis(value));
        }
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_secure() {
        let config = Config::default();
        assert!(config.verifier.enabled);
        assert!(config.verifier.refresh_on_unknown_kid);
        assert_eq!(config.verifier.jwks_ttl, Duration::from_secs(86_400));
        assert_eq!(config.login.expiry_buffer, Duration::from_secs(300));
        assert_eq!(config.exchange.safety_margin, Duration::from_secs(60));
        assert_eq!(config.exchange.actor_scope, "openid");
        assert_eq!(config.login.redirect_uri, DEFAULT_REDIRECT_URI);
        assert!(config.verifier.public_paths.contains(&AGENT_CARD_PATH.to_string()));
    }

    #[test]
    fn placeholders_are_not_configured() {
        assert!(is_configured("VAX1"));
        assert!(!is_configured(""));
        assert!(!is_configured("   "));
        assert!(!is_configured("<YOUR_VACCINATION_AGENT_SECRET>"));
        assert!(!is_configured("<your_client_id"));
    }

    #[test]
    fn missing_endpoint_names_the_key() {
        let idp = IdpConfig::default();
        let err = idp.token_url().unwrap_err().to_string();
        assert!(err.contains("idp.token_url"), "{err}");

        let idp = IdpConfig {
            token_url: Some("<token endpoint>".into()),
            ..Default::default()
        };
        let err = idp.token_url().unwrap_err().to_string();
        assert!(err.contains("placeholder"), "{err}");
    }

    #[test]
    fn exchange_url_falls_back_to_token_url() {
        let idp = IdpConfig {
            token_url: Some("https://idp.example/oauth2/token".into()),
            ..Default::default()
        };
        assert_eq!(
            idp.token_exchange_url().unwrap(),
            "https://idp.example/oauth2/token"
        );
    }

    #[test]
    fn jwks_url_derived_from_issuer() {
        let idp = IdpConfig {
            issuer: Some("https://idp.example/t/pets/".into()),
            ..Default::default()
        };
        assert_eq!(
            idp.jwks_url().unwrap(),
            "https://idp.example/t/pets/.well-known/jwks.json"
        );
    }

    #[test]
    fn accepted_audiences_merge_and_dedupe() {
        let idp = IdpConfig {
            api_resource_identifier: Some("https://api.pets.example".into()),
            ..Default::default()
        };
        let verifier = VerifierConfig {
            client_id: Some("APPT1".into()),
            audiences: vec!["APPT1".into(), "<placeholder>".into()],
            ..Default::default()
        };
        assert_eq!(
            verifier.accepted_audiences(&idp),
            vec!["APPT1".to_string(), "https://api.pets.example".to_string()]
        );
    }

    #[test]
    fn http_timeout_defaults_and_parses() {
        assert_eq!(Config::default().idp.http_timeout, Duration::from_secs(10));
        let idp: IdpConfig = serde_yaml::from_str("http_timeout: 250ms").unwrap();
        assert_eq!(idp.http_timeout, Duration::from_millis(250));
        assert!(idp.token_url.is_none());
        assert!(Config::default().http_client().is_ok());
    }

    #[test]
    fn durations_parse() {
        use humantime_serde::parse;
        assert_eq!(parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse("7").unwrap(), Duration::from_secs(7));
        assert!(parse("soon").is_err());
    }

    #[test]
    fn duration_overflow_is_an_error() {
        use humantime_serde::parse;
        let err = parse(&format!("{}h", u64::MAX)).unwrap_err();
        assert!(err.contains("out of range"), "{err}");
        assert!(parse(&format!("{}m", u64::MAX / 2)).is_err());
        assert_eq!(
            parse(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn yaml_round_trip_of_services() {
        let yaml = r#"
idp:
  token_url: "https://idp.example/oauth2/token"
  issuer: "https://idp.example/oauth2/token"
login:
  flow: device
  device_timeout: "2m"
services:
  "Pet Vaccination Assistant":
    client_id: VAX1
    client_secret: s3cret
    required_scope: "vaccination:read"
agents:
  - "http://localhost:10005"
verifier:
  jwks_ttl: "12h"
  public_paths: ["/health", "/public/*"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.login.flow, LoginFlow::Device);
        assert_eq!(config.login.device_timeout, Duration::from_secs(120));
        assert_eq!(config.verifier.jwks_ttl, Duration::from_secs(43_200));
        let vax = &config.services["Pet Vaccination Assistant"];
        assert_eq!(vax.client_id, "VAX1");
        assert_eq!(vax.required_scope, "vaccination:read");
        assert_eq!(config.agents.len(), 1);
    }

    #[test]
    fn load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "AGENT_DELEGATION_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(
            env::var("AGENT_DELEGATION_TEST_KEY_A").unwrap(),
            "hello_from_env_file"
        );
    }

    #[test]
    fn load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Config::load(Some(Path::new("/nonexistent/delegation.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
