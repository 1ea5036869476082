//! a2a-relay: A2A protocol relay in front of containerized agents
//!
//! Usage:
//!   a2a-relay --config relay.toml serve
//!   a2a-relay --config relay.toml check-config
//!   a2a-relay card https://agent.internal/

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use relay_a2a::CardResolver;
use relay_gateway::RelayConfig;
use relay_gateway::config::AuthConfig;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "a2a-relay")]
#[command(version)]
#[command(about = "A2A protocol relay: discovery, auth, routing and streaming")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "RELAY_CONFIG", default_value = "relay.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, env = "RELAY_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Serve,

    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Fetch and print an agent's card
    Card {
        /// Base URL of the agent
        endpoint: String,
    },
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Commands::Serve => {
            let config = RelayConfig::load(&cli.config)?;
            info!(
                "a2a-relay v{} starting with {}",
                env!("CARGO_PKG_VERSION"),
                cli.config.display()
            );
            let shutdown = CancellationToken::new();
            tokio::spawn(wait_for_signal(shutdown.clone()));
            relay_gateway::serve(config, shutdown).await?;
        }
        Commands::CheckConfig => {
            let config = RelayConfig::load(&cli.config)?;
            let scheme = match &config.auth {
                AuthConfig::Bearer(_) => "bearer",
                AuthConfig::Signed(_) => "signed",
            };
            println!("Configuration OK: {}", cli.config.display());
            println!("  bind:   {}", config.server.bind);
            println!("  auth:   {}", scheme);
            for agent in &config.agents {
                println!(
                    "  agent:  {} -> {}{}",
                    agent.name,
                    agent.endpoint().unwrap_or_default(),
                    if config.default_agent().is_some_and(|d| d.name == agent.name) {
                        " (default)"
                    } else {
                        ""
                    }
                );
            }
        }
        Commands::Card { endpoint } => {
            let resolver = CardResolver::with_defaults()?;
            let card = resolver
                .resolve(&endpoint)
                .await
                .with_context(|| format!("Failed to resolve agent card at {}", endpoint))?;
            println!("{}", serde_json::to_string_pretty(card.as_ref())?);
        }
    }

    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
