//! Credential resolution: display name → service identity
//!
//! Resolvers are tried in order and their answers merged field by field, the
//! first non-empty value winning. The usual chain is the explicit `services`
//! map, then structured agent-card metadata, then the environment heuristic.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::AgentCard;
use crate::config::{ServiceConfig, is_configured};
use crate::oauth::ServiceIdentity;
use crate::{Error, Result};

/// Environment variable suffix for a service's client id
pub const APP_ID_SUFFIX: &str = "_APP_ID";
/// Environment variable suffix for a service's client secret
pub const APP_SECRET_SUFFIX: &str = "_APP_SECRET";
/// Environment variable suffix for a service's required scope
pub const REQUIRED_SCOPE_SUFFIX: &str = "_REQUIRED_SCOPE";

/// Words ignored when deriving variable names from a display name
const FILLER_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "for", "of", "to", "in", "on", "at", "assistant",
    "agent", "service", "helper", "bot", "system", "manager", "handler", "processor", "worker",
    "server", "client", "api", "pet", "pets",
];

/// Read access to environment-style configuration
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// The process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Partially known credentials for one service
#[derive(Default, Clone, PartialEq, Eq)]
pub struct CredentialHints {
    /// Client id
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<String>,
    /// Required scope
    pub required_scope: Option<String>,
}

impl std::fmt::Debug for CredentialHints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHints")
            .field("client_id", &self.client_id)
            .field("has_secret", &self.client_secret.is_some())
            .field("required_scope", &self.required_scope)
            .finish()
    }
}

impl CredentialHints {
    fn configured(value: Option<String>) -> Option<String> {
        value.filter(|v| is_configured(v))
    }

    /// Fill fields still missing from `other`
    pub fn merge(&mut self, other: Self) {
        if self.client_id.is_none() {
            self.client_id = Self::configured(other.client_id);
        }
        if self.client_secret.is_none() {
            self.client_secret = Self::configured(other.client_secret);
        }
        if self.required_scope.is_none() {
            self.required_scope = Self::configured(other.required_scope);
        }
    }

    /// All three fields known
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.client_id.is_some() && self.client_secret.is_some() && self.required_scope.is_some()
    }
}

/// One source of service credentials
pub trait CredentialResolver: Send + Sync {
    /// Source name for logs
    fn source(&self) -> &'static str;

    /// Whatever this source knows about `name`
    fn resolve(&self, name: &str, card: Option<&AgentCard>) -> CredentialHints;
}

/// Explicit registry from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    services: HashMap<String, ServiceConfig>,
}

impl StaticResolver {
    /// Create from the `services` config map
    #[must_use]
    pub fn new(services: HashMap<String, ServiceConfig>) -> Self {
        Self { services }
    }
}

impl CredentialResolver for StaticResolver {
    fn source(&self) -> &'static str {
        "config"
    }

    fn resolve(&self, name: &str, _card: Option<&AgentCard>) -> CredentialHints {
        self.services
            .get(name)
            .map(|s| CredentialHints {
                client_id: Some(s.client_id.clone()),
                client_secret: s.client_secret.clone(),
                required_scope: Some(s.required_scope.clone()),
            })
            .unwrap_or_default()
    }
}

/// `metadata.auth` of the agent card; never carries a secret
#[derive(Debug, Clone, Copy, Default)]
pub struct CardMetadataResolver;

impl CredentialResolver for CardMetadataResolver {
    fn source(&self) -> &'static str {
        "agent-card"
    }

    fn resolve(&self, _name: &str, card: Option<&AgentCard>) -> CredentialHints {
        card.and_then(AgentCard::auth)
            .map(|auth| CredentialHints {
                client_id: auth.application_id.clone(),
                client_secret: None,
                required_scope: auth.required_scope.clone(),
            })
            .unwrap_or_default()
    }
}

/// Best-effort lookup of `{PREFIX}_APP_ID` style variables.
///
/// Prefixes are derived from the display name; see [`env_prefixes`].
pub struct EnvResolver {
    env: Arc<dyn EnvSource>,
    aliases: Vec<(String, String)>,
}

impl EnvResolver {
    /// Resolve against `env`
    pub fn new(env: Arc<dyn EnvSource>) -> Self {
        Self {
            env,
            aliases: Vec::new(),
        }
    }

    /// Try `prefix` first for names containing `keyword` (case-insensitive)
    #[must_use]
    pub fn with_alias(mut self, keyword: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.aliases
            .push((keyword.into().to_lowercase(), prefix.into().to_uppercase()));
        self
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.env.var(key).filter(|v| is_configured(v))
    }

    fn prefixes(&self, name: &str) -> Vec<String> {
        let lower = name.to_lowercase();
        let mut prefixes: Vec<String> = self
            .aliases
            .iter()
            .filter(|(keyword, _)| lower.contains(keyword.as_str()))
            .map(|(_, prefix)| prefix.clone())
            .collect();
        for prefix in env_prefixes(name) {
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
        prefixes
    }
}

impl CredentialResolver for EnvResolver {
    fn source(&self) -> &'static str {
        "environment"
    }

    fn resolve(&self, name: &str, _card: Option<&AgentCard>) -> CredentialHints {
        let prefixes = self.prefixes(name);

        // A prefix counts once its client id is set
        for prefix in &prefixes {
            if let Some(client_id) = self.lookup(&format!("{prefix}{APP_ID_SUFFIX}")) {
                debug!(service = %name, prefix = %prefix, "Resolved credentials from environment");
                return CredentialHints {
                    client_id: Some(client_id),
                    client_secret: self.lookup(&format!("{prefix}{APP_SECRET_SUFFIX}")),
                    required_scope: self.lookup(&format!("{prefix}{REQUIRED_SCOPE_SUFFIX}")),
                };
            }
        }

        // Card metadata may supply the id; the secret can still live here
        for prefix in &prefixes {
            if let Some(secret) = self.lookup(&format!("{prefix}{APP_SECRET_SUFFIX}")) {
                return CredentialHints {
                    client_id: None,
                    client_secret: Some(secret),
                    required_scope: self.lookup(&format!("{prefix}{REQUIRED_SCOPE_SUFFIX}")),
                };
            }
        }

        CredentialHints::default()
    }
}

/// Candidate variable prefixes for a display name, most specific first:
/// the first significant word, significant words joined with `_`, every word
/// joined with `_`, and significant words concatenated.
///
/// `"Pet Vaccination Assistant"` → `VACCINATION`, `PET_VACCINATION_ASSISTANT`.
#[must_use]
pub fn env_prefixes(name: &str) -> Vec<String> {
    let words: Vec<String> = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_uppercase)
        .collect();
    let significant: Vec<&String> = words
        .iter()
        .filter(|w| !FILLER_WORDS.contains(&w.to_lowercase().as_str()))
        .collect();

    let mut candidates = Vec::new();
    match significant.first() {
        Some(first) => candidates.push((*first).clone()),
        None => candidates.extend(words.first().cloned()),
    }
    if significant.len() > 1 {
        let joined: Vec<&str> = significant.iter().map(|w| w.as_str()).collect();
        candidates.push(joined.join("_"));
    }
    candidates.push(words.join("_"));
    if significant.len() > 1 {
        candidates.push(significant.iter().map(|w| w.as_str()).collect::<String>());
    }

    let mut unique = Vec::new();
    for c in candidates {
        if !c.is_empty() && !unique.contains(&c) {
            unique.push(c);
        }
    }
    unique
}

/// Ordered resolvers with field-wise merging
#[derive(Default)]
pub struct ResolverChain {
    resolvers: Vec<Box<dyn CredentialResolver>>,
}

impl ResolverChain {
    /// Empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolver
    #[must_use]
    pub fn with(mut self, resolver: impl CredentialResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }

    /// Config map, then card metadata, then environment
    pub fn standard(services: HashMap<String, ServiceConfig>, env: Arc<dyn EnvSource>) -> Self {
        Self::new()
            .with(StaticResolver::new(services))
            .with(CardMetadataResolver)
            .with(EnvResolver::new(env))
    }

    /// Resolve `name` into an identity.
    ///
    /// A missing client id or scope is [`Error::DelegationUnavailable`]. A
    /// missing secret is not: the identity is returned and minting an actor
    /// token for it reports the configuration error.
    pub fn resolve(&self, name: &str, card: Option<&AgentCard>) -> Result<ServiceIdentity> {
        let mut hints = CredentialHints::default();
        for resolver in &self.resolvers {
            let found = resolver.resolve(name, card);
            if found != CredentialHints::default() {
                debug!(
                    service = %name,
                    source = resolver.source(),
                    hints = ?found,
                    "Credential hints"
                );
            }
            hints.merge(found);
            if hints.is_complete() {
                break;
            }
        }

        let unavailable = |reason: &str| Error::DelegationUnavailable {
            service: name.to_string(),
            reason: reason.to_string(),
        };
        let client_id = hints
            .client_id
            .ok_or_else(|| unavailable("no client id configured"))?;
        let required_scope = hints
            .required_scope
            .ok_or_else(|| unavailable("no required scope configured"))?;

        Ok(ServiceIdentity::new(
            name,
            client_id,
            hints.client_secret,
            required_scope,
        ))
    }
}
