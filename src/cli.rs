//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Per-service OAuth2 delegation for multi-agent deployments
#[derive(Parser, Debug)]
#[command(name = "agent-delegation")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "AGENT_DELEGATION_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "AGENT_DELEGATION_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AGENT_DELEGATION_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Sign in and print the master token's subject, scope and expiry
    Login {
        /// Use the device flow regardless of configuration
        #[arg(long)]
        device: bool,

        /// Print the URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,
    },

    /// Fetch agent cards and report delegation availability per service
    Discover {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Sign in and exchange for one service's delegated token
    Exchange {
        /// Service display name
        #[arg(short, long)]
        service: String,

        /// Print the raw token
        #[arg(long)]
        show_token: bool,
    },

    /// Send a message to a service with a delegated token
    Call {
        /// Service display name
        #[arg(short, long)]
        service: String,

        /// Message text
        #[arg(short, long)]
        message: String,
    },

    /// Run the protected service shim
    Serve {
        /// Port to listen on
        #[arg(short, long, env = "AGENT_DELEGATION_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "AGENT_DELEGATION_HOST")]
        host: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exchange_with_global_flags() {
        let cli = Cli::try_parse_from([
            "agent-delegation",
            "exchange",
            "--service",
            "Pet Vaccination Assistant",
            "--log-level",
            "debug",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(
            cli.command,
            Command::Exchange {
                ref service,
                show_token: false,
            } if service == "Pet Vaccination Assistant"
        ));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["agent-delegation"]).is_err());
    }
}
