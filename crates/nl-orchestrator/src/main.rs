//! NodeLease orchestrator
//!
//! Runs one session: rents a node, starts the configured server on it and
//! forwards a local port to it until the server exits or the user stops it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nl_core::config::{self, SessionConfig};
use nl_orchestrator::{listen_for_signals, LocalMarket, Orchestrator, SessionOutcome};

#[derive(Parser)]
#[command(name = "nl-orchestrator")]
#[command(about = "Rent a node, run a server on it and tunnel it locally")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local listen address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Local port to listen on (overrides config)
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Remote port to forward to (overrides config)
    #[arg(short = 'r', long)]
    remote_port: Option<u16>,

    /// Command to run on the node (overrides config)
    #[arg(long)]
    command: Option<String>,

    /// Output line that marks the server as ready (overrides config)
    #[arg(long)]
    marker: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, config: &mut SessionConfig) {
        if let Some(bind) = &self.bind {
            config.tunnel.bind_address = bind.clone();
        }
        if let Some(port) = self.local_port {
            config.tunnel.local_port = port;
        }
        if let Some(port) = self.remote_port {
            config.tunnel.remote_port = port;
        }
        if let Some(command) = &self.command {
            config.process.command = command.clone();
        }
        if let Some(marker) = &self.marker {
            config.process.readiness_marker = marker.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("NodeLease orchestrator starting...");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                SessionConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            SessionConfig::default()
        }
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    let market = Arc::new(LocalMarket::new());
    let orchestrator = Orchestrator::new(config, market.clone());
    let coordinator = orchestrator.shutdown_coordinator();

    let signals = tokio::spawn(listen_for_signals(coordinator.clone()));

    let report = tokio::select! {
        report = orchestrator.run() => report,
        _ = coordinator.forced() => {
            tracing::error!("Cleanup abandoned, exiting immediately");
            // Nothing reaps the children once the runtime is gone
            market.kill_all();
            std::process::exit(1);
        }
    };
    signals.abort();

    match &report.outcome {
        SessionOutcome::Completed => tracing::info!("Session {} completed", report.session_id),
        SessionOutcome::Cancelled => tracing::info!("Session {} cancelled", report.session_id),
        SessionOutcome::Failed(e) => {
            tracing::error!("Session {} failed: {}", report.session_id, e)
        }
    }
    for (step, outcome) in report.cleanup.warnings() {
        tracing::warn!("Cleanup step {} did not finish cleanly: {:?}", step, outcome);
    }

    tracing::info!("Orchestrator shutdown complete");
    std::process::exit(report.exit_code());
}
