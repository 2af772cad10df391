//! Admission-controlled, cached HTTP gateway for the Zeo++ tool.
//!
//! Entry point and error handling boundary. Uses `anyhow` for
//! ergonomic error propagation and user-facing messages.

mod cli;

use zeo_gateway::config;
use zeo_gateway::constants;
use zeo_gateway::env;
use zeo_gateway::logging;
use zeo_gateway::runner;
use zeo_gateway::server;
use zeo_gateway::upload;

use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use cli::args::{CheckArgs, Cli, Command, ServeArgs};
use config::Config;
use env::Env;
use server::AppState;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Check(args) => run_check(args),
        Command::Version => run_version(),
    }
}

/// Print version information.
fn run_version() -> Result<()> {
    println!("{} {}", constants::APP_NAME, constants::VERSION);
    Ok(())
}

/// Load config with layering: defaults, file, environment.
fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path, &Env::real()).context("failed to load configuration")
}

/// Validate the configuration and the tool executable without serving.
fn run_check(args: CheckArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    config.validate().context("invalid configuration")?;
    println!(
        "  configuration ok: {} analysis kind(s), listening on {}",
        config.analyses.len(),
        config.server.bind_addr()
    );

    let engine = runner::ExecutionEngine::from_config(&config.tool);
    let resolved = engine
        .validate_executable()
        .context("tool executable check failed")?;
    println!("  executable ok: {}", resolved.display());
    Ok(())
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    cli::apply_serve_overrides(&mut config, &args);
    config.validate().context("invalid configuration")?;

    logging::init(&config.logging).context("failed to initialise logging")?;

    if config.analyses.is_empty() {
        tracing::warn!("no analyses configured; only health and stats endpoints are useful");
    }

    // Leftovers from a previous run that was killed before cleanup.
    match upload::cleanup_stale(&config.tool.upload_dir, constants::STALE_UPLOAD_AGE).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "removed stale uploads"),
        Err(e) => tracing::warn!("failed to sweep upload directory: {e}"),
    }

    let bind_addr = config.server.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    let state = AppState::from_config(config);
    match state.service.engine().validate_executable() {
        Ok(path) => tracing::info!(executable = %path.display(), "tool executable resolved"),
        Err(e) => tracing::warn!("{e}; analyses will fail until it is installed"),
    }

    let maintenance = state.spawn_maintenance();
    let pool = state.service.pool().cloned();
    tracing::info!(
        addr = %bind_addr,
        analyses = state.config.analyses.len(),
        worker_pool = pool.is_some(),
        "{} {} listening",
        constants::APP_NAME,
        constants::VERSION
    );

    server::serve(listener, state, server::shutdown_signal())
        .await
        .context("server failed")?;

    for handle in maintenance {
        handle.abort();
    }
    if let Some(pool) = pool {
        pool.shutdown().await;
    }
    tracing::info!("server stopped");
    Ok(())
}
