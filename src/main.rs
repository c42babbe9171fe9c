//! Agent Delegation - per-service OAuth2 token delegation
//!
//! Signs a user in once and hands each downstream service a token narrowed to
//! itself.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use agent_delegation::{
    cli::{Cli, Command},
    config::{Config, LoginFlow},
    delegation::DelegationContext,
    discovery::{self, AgentRegistry, ProcessEnv, ResolverChain},
    oauth::{BrowserLauncher, CredentialAcquirer, PrintOnly, SystemBrowser, TokenExchanger},
    service, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config =
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let http = config
        .http_client()
        .context("Failed to build HTTP client")?;
    let resolvers = ResolverChain::standard(config.services.clone(), Arc::new(ProcessEnv));

    match cli.command {
        Command::Login { device, no_browser } => {
            if device {
                config.login.flow = LoginFlow::Device;
            }
            if no_browser {
                config.login.open_browser = false;
            }
            run_login(&config, http, &resolvers).await
        }
        Command::Discover { format } => run_discover(&config, &http, &resolvers, &format).await,
        Command::Exchange {
            service,
            show_token,
        } => run_exchange(&config, http, &resolvers, &service, show_token).await,
        Command::Call { service, message } => {
            run_call(&config, http, &resolvers, &service, &message).await
        }
        Command::Serve { port, host } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            info!(
                version = env!("CARGO_PKG_VERSION"),
                name = %config.server.name,
                "Starting service"
            );
            service::run(&config).await.context("Service failed")
        }
    }
}

fn acquirer(
    config: &Config,
    http: reqwest::Client,
    resolvers: &ResolverChain,
) -> anyhow::Result<CredentialAcquirer> {
    let browser: Arc<dyn BrowserLauncher> = if config.login.open_browser {
        Arc::new(SystemBrowser)
    } else {
        Arc::new(PrintOnly)
    };
    let actor = config
        .login
        .requested_actor
        .as_deref()
        .map(|name| resolvers.resolve(name, None))
        .transpose()
        .context("Failed to resolve the requested actor")?;

    CredentialAcquirer::from_config(config, http, browser, actor)
        .context("Sign-in is not configured")
}

async fn run_login(
    config: &Config,
    http: reqwest::Client,
    resolvers: &ResolverChain,
) -> anyhow::Result<()> {
    let token = acquirer(config, http, resolvers)?
        .authenticate()
        .await
        .context("Sign-in failed")?;

    println!("✅ Signed in");
    println!("   Subject: {}", token.subject().unwrap_or("-"));
    println!("   Scope:   {}", token.scope.as_deref().unwrap_or("-"));
    if let Some(left) = token.time_until_expiry() {
        println!("   Expires: in {}s", left.as_secs());
    }
    Ok(())
}

async fn run_discover(
    config: &Config,
    http: &reqwest::Client,
    resolvers: &ResolverChain,
    format: &str,
) -> anyhow::Result<()> {
    if config.agents.is_empty() {
        println!("No agents configured. Add base URLs under `agents:` in the config file.");
        return Ok(());
    }

    let registry = discovery::discover(http, &config.agents, resolvers).await;
    let report = registry.report();

    if format == "json" {
        let rows: Vec<_> = report
            .iter()
            .map(|(name, outcome)| json!({"service": name, "delegation": outcome}))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "Discovered {} of {} service(s):\n",
        registry.len(),
        config.agents.len()
    );
    for (name, outcome) in report {
        println!("📦 {name}");
        println!("   {outcome}");
    }
    Ok(())
}

async fn registry(
    config: &Config,
    http: &reqwest::Client,
    resolvers: &ResolverChain,
    service: &str,
) -> anyhow::Result<AgentRegistry> {
    let mut registry = discovery::discover(http, &config.agents, resolvers).await;
    if registry.get(service).is_none() {
        // Configured but not discoverable: no endpoint, exchange still works
        let identity = resolvers
            .resolve(service, None)
            .with_context(|| format!("Unknown service '{service}'"))?;
        registry.insert_identity(identity, None);
    }
    Ok(registry)
}

async fn run_exchange(
    config: &Config,
    http: reqwest::Client,
    resolvers: &ResolverChain,
    service: &str,
    show_token: bool,
) -> anyhow::Result<()> {
    let registry = registry(config, &http, resolvers, service).await?;
    let context = DelegationContext::new(
        http.clone(),
        Arc::new(acquirer(config, http.clone(), resolvers)?),
        Arc::new(TokenExchanger::from_config(config, http)?),
        registry,
    );

    let token = context
        .token_for(service)
        .await
        .with_context(|| format!("Token exchange for '{service}' failed"))?;

    println!("✅ Delegated token for {service}");
    if let Some(claims) = token.claims() {
        println!(
            "   Audience: {}",
            claims.aud.map_or_else(|| "-".to_string(), |a| a.to_string())
        );
    }
    println!("   Scope:    {}", token.scope.as_deref().unwrap_or("-"));
    if show_token {
        println!("   Token:    {}", token.token);
    }
    Ok(())
}

async fn run_call(
    config: &Config,
    http: reqwest::Client,
    resolvers: &ResolverChain,
    service: &str,
    message: &str,
) -> anyhow::Result<()> {
    let registry = discovery::discover(&http, &config.agents, resolvers).await;
    let context = DelegationContext::new(
        http.clone(),
        Arc::new(acquirer(config, http.clone(), resolvers)?),
        Arc::new(TokenExchanger::from_config(config, http)?),
        registry,
    );

    let response = context
        .call(service, &json!({ "message": message }))
        .await
        .with_context(|| format!("Call to '{service}' failed"))?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
