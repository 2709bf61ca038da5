//! BLEHome CLI entry point

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blehome_cli::{
    cli::Cli,
    commands::CommandDispatcher,
    config::{AppConfig, ConfigOverrides},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration: defaults, blehome.toml, BLEHOME_* env, flags
    let config = AppConfig::load(&ConfigOverrides::from(&cli))
        .context("failed to load configuration")?;
    info!(address = %config.mesh.address, role = %config.mesh.role, "Configuration loaded");

    // Execute the command
    CommandDispatcher::execute(cli, config)
        .await
        .context("command failed")?;

    Ok(())
}

/// Setup logging: RUST_LOG wins, otherwise info (debug with --verbose)
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();
}
