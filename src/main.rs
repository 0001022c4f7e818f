//! Application entry-point: loads configuration, initialises tracing and the
//! metrics server, wires the engine, and drives the graceful shutdown
//! sequence from SIGINT. Exit codes: 0 normal shutdown, 1 configuration
//! failure at startup, 2 unrecoverable runtime error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use flasharb::config::Config;
use flasharb::engine::ArbEngine;
use flasharb::errors::EngineError;
use flasharb::metrics::start_metrics_server;

#[derive(Debug, Parser)]
#[command(name = "flasharb", about = "Flash-loan funded cross-venue arbitrage engine")]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Force simulation mode for the next N scanner ticks, then restore
    /// the configured behavior.
    #[arg(long)]
    simulate: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::from_default_env()
        .add_directive("ethers_providers=warn".parse().expect("static directive"))
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("reqwest=warn".parse().expect("static directive"))
        .add_directive("flasharb=info".parse().expect("static directive"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::load(&cli.config).await {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "configuration failure");
            return ExitCode::from(1);
        }
    };
    info!(path = %cli.config.display(), chains = config.chains.len(), "configuration loaded");

    let _metrics = start_metrics_server(
        config.operator.metrics_host.clone(),
        config.operator.metrics_port,
    );

    let engine = match ArbEngine::new(config.clone()) {
        Ok(engine) => Arc::new(engine),
        Err(EngineError::Config(e)) => {
            error!(error = %e, "configuration failure");
            return ExitCode::from(1);
        }
        Err(e) => {
            error!(error = %e, "engine construction failed");
            return ExitCode::from(2);
        }
    };

    engine.start().await;
    if let Some(ticks) = cli.simulate {
        info!(ticks, "forcing simulation mode");
        engine.simulate_for_ticks(ticks);
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("SIGINT - shutting down"),
        Err(e) => {
            error!(error = %e, "signal handler failed");
            engine.stop().await;
            return ExitCode::from(2);
        }
    }

    engine.stop().await;
    info!("final status:\n{}", engine.status().await);
    ExitCode::SUCCESS
}
