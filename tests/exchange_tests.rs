//! Token exchange against a mock identity provider

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer};

use agent_delegation::Error;
use agent_delegation::oauth::{
    ActorTokenMinter, Audience, GRANT_TOKEN_EXCHANGE, MasterToken, ServiceIdentity,
    TOKEN_TYPE_ACCESS_TOKEN, TOKEN_TYPE_JWT, TokenEndpoint, TokenExchanger,
};
use common::*;

fn vaccination() -> ServiceIdentity {
    ServiceIdentity::new(
        "Pet Vaccination Assistant",
        "VAX1",
        Some("vax-secret".to_string()),
        "vaccination:read",
    )
}

fn appointments() -> ServiceIdentity {
    ServiceIdentity::new(
        "Pet Appointment Scheduler",
        "APPT1",
        Some("appt-secret".to_string()),
        "appointments:read",
    )
}

fn exchanger(server: &MockServer, api_resource: Option<&str>) -> TokenExchanger {
    let endpoint = TokenEndpoint::new(reqwest::Client::new(), format!("{}/token", server.uri()));
    TokenExchanger::new(
        endpoint.clone(),
        ActorTokenMinter::new(endpoint, "openid"),
        api_resource.map(str::to_string),
        Duration::from_secs(60),
    )
}

async fn mount_idp(server: &MockServer, expires_in: u64, exchanges: u64) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(GrantType("client_credentials"))
        .respond_with(ActorTokens)
        .expect(exchanges)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(GrantType(GRANT_TOKEN_EXCHANGE))
        .respond_with(ExchangeTokens { expires_in })
        .expect(exchanges)
        .mount(server)
        .await;
}

async fn exchange_requests(server: &MockServer) -> Vec<wiremock::Request> {
    server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| form(r).get("grant_type").map(String::as_str) == Some(GRANT_TOKEN_EXCHANGE))
        .collect()
}

#[tokio::test]
async fn delegated_token_is_narrowed_to_the_service() {
    let server = MockServer::start().await;
    mount_idp(&server, 3600, 1).await;
    let exchanger = exchanger(&server, None);
    let master = master_token();

    let token = exchanger.exchange(&master, &vaccination()).await.unwrap();

    let claims = token.claims().unwrap();
    assert_eq!(claims.aud, Some(Audience::Single("VAX1".to_string())));
    assert_eq!(claims.scope.as_deref(), Some("vaccination:read"));

    let requests = exchange_requests(&server).await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let form = form(request);
    assert_eq!(form["scope"], "vaccination:read");
    assert_eq!(form["subject_token"], master.access_token);
    assert_eq!(form["subject_token_type"], TOKEN_TYPE_JWT);
    assert_eq!(form["requested_token_type"], TOKEN_TYPE_ACCESS_TOKEN);
    assert_eq!(form["actor_token"], "actor-VAX1");
    assert_eq!(form["actor_token_type"], TOKEN_TYPE_ACCESS_TOKEN);
    assert!(!form.contains_key("audience"));
    // Authenticated as the service, not the orchestrator
    assert_eq!(
        basic_auth(request),
        Some(("VAX1".to_string(), "vax-secret".to_string()))
    );
}

#[tokio::test]
async fn cached_token_is_served_without_network() {
    let server = MockServer::start().await;
    mount_idp(&server, 3600, 1).await;
    let exchanger = exchanger(&server, None);
    let master = master_token();

    let first = exchanger.exchange(&master, &vaccination()).await.unwrap();
    let second = exchanger.exchange(&master, &vaccination()).await.unwrap();

    assert_eq!(first.token, second.token);
    assert_eq!(exchanger.len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn concurrent_callers_share_one_exchange() {
    let server = MockServer::start().await;
    mount_idp(&server, 3600, 1).await;
    let exchanger = Arc::new(exchanger(&server, None));
    let master = master_token();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let exchanger = Arc::clone(&exchanger);
            let master = master.clone();
            tokio::spawn(async move { exchanger.exchange(&master, &vaccination()).await })
        })
        .collect();

    let mut tokens = Vec::new();
    for handle in handles {
        tokens.push(handle.await.unwrap().unwrap().token);
    }

    tokens.dedup();
    assert_eq!(tokens.len(), 1);
    assert_eq!(exchange_requests(&server).await.len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn token_inside_safety_margin_is_re_exchanged() {
    let server = MockServer::start().await;
    // 30s of life is inside the 60s margin
    mount_idp(&server, 30, 2).await;
    let exchanger = exchanger(&server, None);
    let master = master_token();

    exchanger.exchange(&master, &vaccination()).await.unwrap();
    assert!(exchanger.cached("Pet Vaccination Assistant").is_none());
    exchanger.exchange(&master, &vaccination()).await.unwrap();

    server.verify().await;
}

#[tokio::test]
async fn invalidate_forces_a_new_exchange() {
    let server = MockServer::start().await;
    mount_idp(&server, 3600, 2).await;
    let exchanger = exchanger(&server, None);
    let master = master_token();

    exchanger.exchange(&master, &vaccination()).await.unwrap();
    exchanger.invalidate("Pet Vaccination Assistant");
    assert!(exchanger.is_empty());
    exchanger.exchange(&master, &vaccination()).await.unwrap();

    server.verify().await;
}

#[tokio::test]
async fn failure_is_scoped_to_one_service() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(GrantType("client_credentials"))
        .respond_with(ActorTokens)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(GrantType(GRANT_TOKEN_EXCHANGE))
        .and(BasicClient("VAX1"))
        .respond_with(oauth_error(400, "invalid_scope"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(GrantType(GRANT_TOKEN_EXCHANGE))
        .and(BasicClient("APPT1"))
        .respond_with(ExchangeTokens { expires_in: 3600 })
        .mount(&server)
        .await;
    let exchanger = exchanger(&server, None);
    let master = master_token();

    let appt = exchanger.exchange(&master, &appointments()).await.unwrap();
    let err = exchanger.exchange(&master, &vaccination()).await.unwrap_err();

    match err {
        Error::Exchange { service, message } => {
            assert_eq!(service, "Pet Vaccination Assistant");
            assert!(message.contains("invalid_scope"), "{message}");
        }
        other => panic!("expected exchange error, got {other:?}"),
    }
    // The other service's entry survives
    let cached = exchanger.cached("Pet Appointment Scheduler").unwrap();
    assert_eq!(cached.token, appt.token);
    assert_eq!(exchanger.len(), 1);
}

#[tokio::test]
async fn missing_service_secret_is_a_config_error() {
    let server = MockServer::start().await;
    mount_idp(&server, 3600, 0).await;
    let exchanger = exchanger(&server, None);
    let service = ServiceIdentity::new(
        "Pet Vaccination Assistant",
        "VAX1",
        Some("<YOUR_VACCINATION_AGENT_SECRET>".to_string()),
        "vaccination:read",
    );

    let err = exchanger.exchange(&master_token(), &service).await.unwrap_err();

    assert!(matches!(err, Error::Config(_)), "{err:?}");
    server.verify().await;
}

#[tokio::test]
async fn expired_master_token_blocks_exchange() {
    let server = MockServer::start().await;
    mount_idp(&server, 3600, 0).await;
    let exchanger = exchanger(&server, None);
    let master = MasterToken {
        expires_at: now() - 10,
        ..master_token()
    };

    let err = exchanger.exchange(&master, &vaccination()).await.unwrap_err();

    assert!(matches!(err, Error::MasterTokenExpired), "{err:?}");
    server.verify().await;
}

#[tokio::test]
async fn api_resource_qualifies_scope_and_binds_audience() {
    let server = MockServer::start().await;
    mount_idp(&server, 3600, 1).await;
    let exchanger = exchanger(&server, Some("https://api.pets.example"));

    exchanger
        .exchange(&master_token(), &vaccination())
        .await
        .unwrap();

    let requests = exchange_requests(&server).await;
    let form = form(&requests[0]);
    assert_eq!(form["scope"], "openid https://api.pets.example/vaccination:read");
    assert_eq!(form["audience"], "https://api.pets.example");
    assert_eq!(form["resource"], "https://api.pets.example");
}
