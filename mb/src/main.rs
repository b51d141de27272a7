//! modelbridge - multi-backend AI inference gateway
//!
//! Binary entry point: loads config, assembles the gateway context, and
//! either serves the stdio tool protocol or runs a one-shot command.

use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;

use modelbridge::backend::CompletionOptions;
use modelbridge::cli::{Cli, Command};
use modelbridge::config::Config;
use modelbridge::gateway::Gateway;
use modelbridge::router::RouteRequest;
use modelbridge::wire::server::serve_stdio;
use modelbridge::wire::ToolDispatcher;

/// Logging goes to stderr: stdout is the wire protocol channel.
fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let level = cli_log_level.or(config_log_level).unwrap_or("info");
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("modelbridge={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(cli.log_level.as_deref(), config.log_level.as_deref())?;

    let gateway = Arc::new(Gateway::new(config).await.map_err(|e| eyre::eyre!(e.to_string()))?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let dispatcher = ToolDispatcher::new(gateway);
            serve_stdio(&dispatcher).await?;
        }
        Command::Health { probe } => {
            if probe {
                info!("Probing all backends");
                gateway.registry.probe_all().await;
            }
            let report = gateway.health_report().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Roles => {
            for role in gateway.roles.list() {
                println!("{:<20} [{}] {}", role.name, role.category, role.description);
            }
        }
        Command::Ask {
            prompt,
            backend,
            max_tokens,
        } => {
            let outcome = gateway
                .router
                .route(RouteRequest {
                    prompt,
                    options: CompletionOptions {
                        max_tokens,
                        ..Default::default()
                    },
                    preferred: backend,
                    ..Default::default()
                })
                .await
                .map_err(|e| eyre::eyre!(e.to_string()))?;

            info!(backend = %outcome.winner, latency_ms = outcome.response.latency_ms, "Answered");
            println!("{}", outcome.response.content);
        }
    }

    Ok(())
}
