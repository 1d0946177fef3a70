use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use uppe_engine::config::Config;
use uppe_engine::database::initialize_database;
use uppe_engine::orchestrator::Orchestrator;
use uppe_engine::pool::open_local_pool;

#[derive(Debug, Parser)]
#[command(version, about = "Uppe monitor execution engine")]
struct Cli {
    /// Path to the config file (defaults to $XDG_CONFIG_HOME/uppe/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run every active monitor until interrupted (default)
    Run,
    /// Print the effective configuration
    Config,
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Failed to load .env: {e}");
        }
    }
    logger::init();

    let cli = Cli::parse();
    let config = Config::from_config(cli.config.as_ref())?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Config => {
            print!("{config}");
            Ok(())
        }
        Command::Migrate => {
            let pool = open_local_pool(&config.database.path, config.database.pool_size).await?;
            let conn = pool.get().await?;
            initialize_database(&conn).await?;
            info!(path = %config.database.path.display(), "Migrations applied");
            Ok(())
        }
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> Result<()> {
    info!(path = %config.database.path.display(), "Opening database");
    let pool = open_local_pool(&config.database.path, config.database.pool_size).await?;

    let (orchestrator, _publisher) = Orchestrator::from_config(&config, pool).await?;
    orchestrator.bootstrap().await?;

    info!("Uppe engine running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }

    orchestrator.shutdown().await;
    Ok(())
}
