//! Service discovery
//!
//! Fetches each configured service's self-description (its agent card),
//! resolves the service's credentials and records the outcome in an
//! [`AgentRegistry`]. The registry is built once per run and handed to the
//! delegation context; nothing here is process-global.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub mod resolver;

pub use resolver::{
    CardMetadataResolver, CredentialHints, CredentialResolver, EnvResolver, EnvSource,
    ProcessEnv, ResolverChain, StaticResolver, env_prefixes,
};

use crate::config::AGENT_CARD_PATH;
use crate::oauth::ServiceIdentity;
use crate::{Error, Result};

/// A service's public self-description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCard {
    /// Display name; keys every per-service cache
    pub name: String,
    /// What the service does
    #[serde(default)]
    pub description: String,
    /// Endpoint to send requests to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Card version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Advertised skills, kept opaque
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skills: Vec<Value>,
    /// Structured metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CardMetadata>,
}

impl AgentCard {
    /// `metadata.auth`, if published
    #[must_use]
    pub fn auth(&self) -> Option<&AuthMetadata> {
        self.metadata.as_ref()?.auth.as_ref()
    }
}

/// Card metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardMetadata {
    /// Delegation details; `asgardeo` is accepted as an older key
    #[serde(default, alias = "asgardeo", skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthMetadata>,
    /// Everything else
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Delegation details a service publishes about itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthMetadata {
    /// Client id registered for the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
    /// Scope the service requires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_scope: Option<String>,
    /// Issuer the service trusts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
}

/// Whether tokens can be delegated to a service
#[derive(Debug, Clone)]
pub enum Delegation {
    /// Credentials resolved
    Available(ServiceIdentity),
    /// Credentials missing; the reason is reported, not fatal
    Unavailable(String),
}

impl Delegation {
    /// Resolved identity, if any
    #[must_use]
    pub fn identity(&self) -> Option<&ServiceIdentity> {
        match self {
            Self::Available(identity) => Some(identity),
            Self::Unavailable(_) => None,
        }
    }
}

impl std::fmt::Display for Delegation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available(identity) if identity.has_secret() => {
                write!(f, "delegation available ({})", identity.client_id)
            }
            Self::Available(identity) => {
                write!(f, "delegation available ({}, no secret)", identity.client_id)
            }
            Self::Unavailable(reason) => write!(f, "unavailable: {reason}"),
        }
    }
}

/// One discovered service
#[derive(Debug, Clone)]
pub struct DiscoveredAgent {
    /// Base URL the card was fetched from
    pub base_url: Option<String>,
    /// Its card
    pub card: AgentCard,
    /// Resolution outcome
    pub delegation: Delegation,
}

impl DiscoveredAgent {
    /// Where requests to this service go: the card's `url`, else the base URL
    #[must_use]
    pub fn endpoint(&self) -> Option<&str> {
        self.card
            .url
            .as_deref()
            .or(self.base_url.as_deref())
    }
}

/// Services known to this run, keyed by display name
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: HashMap<String, DiscoveredAgent>,
}

impl AgentRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a service
    pub fn insert(&mut self, agent: DiscoveredAgent) {
        self.agents.insert(agent.card.name.clone(), agent);
    }

    /// Register a service by identity, without a fetched card
    pub fn insert_identity(&mut self, identity: ServiceIdentity, endpoint: Option<String>) {
        let card = AgentCard {
            name: identity.name.clone(),
            description: String::new(),
            url: endpoint,
            version: None,
            skills: Vec::new(),
            metadata: None,
        };
        self.insert(DiscoveredAgent {
            base_url: card.url.clone(),
            card,
            delegation: Delegation::Available(identity),
        });
    }

    /// Look up a service
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DiscoveredAgent> {
        self.agents.get(name)
    }

    /// Identity to delegate to `name`
    pub fn identity(&self, name: &str) -> Result<&ServiceIdentity> {
        let agent = self
            .get(name)
            .ok_or_else(|| Error::ServiceNotFound(name.to_string()))?;
        match &agent.delegation {
            Delegation::Available(identity) => Ok(identity),
            Delegation::Unavailable(reason) => Err(Error::DelegationUnavailable {
                service: name.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// All services, unordered
    pub fn iter(&self) -> impl Iterator<Item = &DiscoveredAgent> {
        self.agents.values()
    }

    /// Number of services
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no service is known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// `(name, outcome)` per service, sorted by name
    #[must_use]
    pub fn report(&self) -> Vec<(String, String)> {
        let mut rows: Vec<_> = self
            .agents
            .values()
            .map(|a| (a.card.name.clone(), a.delegation.to_string()))
            .collect();
        rows.sort();
        rows
    }
}

/// Fetch `{base_url}/.well-known/agent-card.json`
pub async fn fetch_card(http: &reqwest::Client, base_url: &str) -> Result<AgentCard> {
    let url = format!("{}{AGENT_CARD_PATH}", base_url.trim_end_matches('/'));
    let card = http
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<AgentCard>()
        .await?;
    Ok(card)
}

/// Discover every base URL and resolve each service's credentials.
///
/// Unreachable services are skipped and services without credentials are
/// recorded as unavailable; neither stops the others.
pub async fn discover(
    http: &reqwest::Client,
    base_urls: &[String],
    resolvers: &ResolverChain,
) -> AgentRegistry {
    let mut registry = AgentRegistry::new();

    for base_url in base_urls {
        let card = match fetch_card(http, base_url).await {
            Ok(card) => card,
            Err(e) => {
                warn!(url = %base_url, error = %e, "Skipping service, agent card unavailable");
                continue;
            }
        };

        let delegation = match resolvers.resolve(&card.name, Some(&card)) {
            Ok(identity) => Delegation::Available(identity),
            Err(Error::DelegationUnavailable { reason, .. }) => Delegation::Unavailable(reason),
            Err(e) => Delegation::Unavailable(e.to_string()),
        };
        info!(service = %card.name, url = %base_url, outcome = %delegation, "Discovered service");

        registry.insert(DiscoveredAgent {
            base_url: Some(base_url.clone()),
            card,
            delegation,
        });
    }

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_metadata_parses() {
        let card: AgentCard = serde_json::from_value(serde_json::json!({
            "name": "Pet Vaccination Assistant",
            "description": "Vaccination records",
            "url": "http://localhost:10006/",
            "capabilities": {"streaming": false},
            "metadata": {
                "auth": {"application_id": "VAX1", "required_scope": "vaccination:read"},
                "owner": "clinic"
            }
        }))
        .unwrap();
        let auth = card.auth().unwrap();
        assert_eq!(auth.application_id.as_deref(), Some("VAX1"));
        assert_eq!(auth.required_scope.as_deref(), Some("vaccination:read"));
        let extra = &card.metadata.as_ref().unwrap().extra;
        assert_eq!(extra.get("owner").and_then(Value::as_str), Some("clinic"));
    }

    #[test]
    fn card_metadata_accepts_asgardeo_key() {
        let card: AgentCard = serde_json::from_value(serde_json::json!({
            "name": "Pet Vaccination Assistant",
            "metadata": {
                "asgardeo": {
                    "application_id": "VAX1",
                    "required_scope": "vaccination:read",
                    "issuer": "https://idp.example/t/pets/oauth2/token"
                }
            }
        }))
        .unwrap();
        let auth = card.auth().unwrap();
        assert_eq!(auth.application_id.as_deref(), Some("VAX1"));
        assert_eq!(
            auth.issuer.as_deref(),
            Some("https://idp.example/t/pets/oauth2/token")
        );
        assert!(card.metadata.as_ref().unwrap().extra.is_empty());
    }

    #[test]
    fn registry_distinguishes_missing_and_unavailable() {
        let mut registry = AgentRegistry::new();
        registry.insert(DiscoveredAgent {
            base_url: Some("http://localhost:10007".into()),
            card: AgentCard {
                name: "Weather".into(),
                description: String::new(),
                url: None,
                version: None,
                skills: Vec::new(),
                metadata: None,
            },
            delegation: Delegation::Unavailable("no client id configured".into()),
        });
        registry.insert_identity(
            ServiceIdentity::new("Vax", "VAX1", Some("s".into()), "vaccination:read"),
            Some("http://localhost:10006".into()),
        );

        assert!(matches!(
            registry.identity("Nope"),
            Err(Error::ServiceNotFound(_))
        ));
        assert!(matches!(
            registry.identity("Weather"),
            Err(Error::DelegationUnavailable { .. })
        ));
        assert_eq!(registry.identity("Vax").unwrap().client_id, "VAX1");
        assert_eq!(
            registry.get("Weather").unwrap().endpoint(),
            Some("http://localhost:10007")
        );

        let report = registry.report();
        assert_eq!(report[0].0, "Vax");
        assert!(report[1].1.starts_with("unavailable"));
    }
}
