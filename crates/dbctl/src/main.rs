//! Helios database control
//!
//! Operator commands for replica health and online index rebuilds.

mod cli;
mod commands;
mod settings;

use clap::Parser;
use tracing::info;

use helios_load_balancing::postgres::PostgresConfig;

use crate::cli::{Cli, Command, init_logging};
use crate::commands::Context;
use crate::settings::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    if let Err(errors) = cli.validate() {
        for error in &errors {
            eprintln!("Configuration error: {}", error);
        }
        std::process::exit(1);
    }

    let settings = Settings::load(cli.config.as_deref())?;
    let primary = match &cli.database_url {
        Some(url) => PostgresConfig::from_url(url)?,
        None => PostgresConfig::from_env(),
    };

    info!(primary = %primary.address(), command = ?cli.command, "Starting helios-dbctl");
    let ctx = Context { primary, settings };

    match &cli.command {
        Command::Reindex { dry_run } => commands::reindex(&ctx, *dry_run).await,
        Command::CleanupLeftovers => commands::cleanup_leftovers(&ctx).await,
        Command::DropIndex { index } => commands::drop_index(&ctx, index).await,
        Command::Discover => commands::discover(&ctx).await,
        Command::Replicas => commands::replicas(&ctx).await,
    }
}
