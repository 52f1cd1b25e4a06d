mod api;
mod app;
mod config;
mod logging;
mod server;
mod telemetry_store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use imf_runtime::shutdown::wait_for_shutdown_signal;
use imf_runtime::supervisor::LocalProcessLauncher;

use crate::config::{AppConfig, CliOverrides};

/// IMF Server - monitoring dashboard backend
#[derive(Parser)]
#[command(name = "imf-server")]
#[command(about = "IMF Server - monitoring dashboard backend")]
#[command(version)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address override for the HTTP server (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Do not start the monitor worker
    #[arg(long)]
    no_worker: bool,

    /// Print effective configuration (JSON) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Run,
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = Cli::parse();

    // 1) defaults -> 2) YAML (if provided) -> 3) env (IMF__*) -> 4) CLI overrides
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliOverrides {
        bind: cli.bind.take(),
        no_worker: cli.no_worker,
        verbose: cli.verbose,
    });
    config.validate()?;

    if cli.print_config {
        println!("{}", config.to_pretty_json()?);
        return Ok(());
    }

    logging::init_logging(&config.logging)?;
    logging::install_panic_hook();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_server(config).await,
        Commands::Check => check_config(&config),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("checking configuration");
    parse_bind_addr(&config.server.bind_addr)?;
    println!("Configuration is valid");
    println!("{}", config.to_pretty_json()?);
    Ok(())
}

fn parse_bind_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("Invalid bind address: {addr}"))
}

async fn run_server(config: AppConfig) -> Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "IMF server starting");

    let addr = parse_bind_addr(&config.server.bind_addr)?;
    let listener = server::bind(addr).await?;

    let launcher = Arc::new(LocalProcessLauncher::from_config(&config.runtime.worker));
    let orchestrator = Arc::new(app::build_orchestrator(&config.runtime, launcher)?);
    orchestrator
        .initialize()
        .await
        .context("failed to initialize services")?;

    let router = api::router(api::AppState::new(Arc::clone(&orchestrator)), &config.server);
    tracing::info!(%addr, "HTTP server bound");
    server::serve(
        orchestrator,
        listener,
        router,
        Duration::from_millis(config.server.drain_timeout_ms),
        wait_for_shutdown_signal(),
    )
    .await?;

    tracing::info!("IMF server stopped");
    Ok(())
}
