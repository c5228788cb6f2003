//! Foreman CLI entry point.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use foreman::cli::{app::App, commands, Cli, Commands};
use foreman::infrastructure::{ConfigLoader, Logger};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init scaffolds the config the other commands load.
    if let Commands::Init { force } = cli.command {
        return commands::handle_init(force).await;
    }

    let mut config = ConfigLoader::load().context("Failed to load configuration")?;
    if let Commands::Orchestrate { workers: Some(workers) } = &cli.command {
        config.orchestrator.workers = *workers;
    }

    let _logger = Logger::init(&config.log).context("Failed to initialize logging")?;

    let app = Arc::new(App::build(&config).await?);

    match cli.command {
        Commands::Init { .. } => unreachable!("handled above"),
        Commands::Orchestrate { .. } => commands::handle_orchestrate(app).await,
        Commands::Project(command) => commands::handle_project(&app, command, cli.json).await,
        Commands::Ticket(command) => commands::handle_ticket(&app, command, cli.json).await,
        Commands::Task(command) => commands::handle_task(&app, command, cli.json).await,
        Commands::Phase(command) => commands::handle_phase(&app, command).await,
        Commands::Lock(command) => commands::handle_lock(&app, command, cli.json).await,
        Commands::Event(command) => commands::handle_event(&app, command, cli.json).await,
    }
}
