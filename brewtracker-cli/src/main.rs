use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod app;
mod commands;
mod config;
mod db;

use app::{open_cache, try_auto_sync};
use commands::{
    ConfigCommand, ConflictCommand, FailedCommand, FermentCommand, RecipeCommand, SessionCommand,
    SyncCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "brew")]
#[command(version)]
#[command(about = "Offline-first homebrewing tracker", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage recipes
    Recipe(RecipeCommand),

    /// Plan and track brew sessions
    Session(SessionCommand),

    /// Record fermentation readings
    Ferment(FermentCommand),

    /// Sync with remote server
    Sync(SyncCommand),

    /// Review and resolve sync conflicts
    Conflict(ConflictCommand),

    /// Review changes the server rejected
    Failed(FailedCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "brewtracker_core=warn,brew=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Save config path for init command
    let cli_config_path = cli.config.clone();

    let config = Config::load(cli.config)?;

    let command = match &cli.command {
        Some(Commands::Config(cmd)) => return cmd.run(&config, cli_config_path),
        Some(command) => command,
        None => {
            println!("Use --help to see available commands");
            return Ok(());
        }
    };

    let cache = open_cache(&config).await?;

    // Auto-sync BEFORE read commands
    if is_read_command(command) {
        try_auto_sync(&cache, &config).await;
    }

    let result = match command {
        Commands::Recipe(cmd) => cmd.run(cache.clone(), &config).await,
        Commands::Session(cmd) => cmd.run(cache.clone(), &config).await,
        Commands::Ferment(cmd) => cmd.run(cache.clone(), &config).await,
        Commands::Sync(cmd) => cmd.run(&cache, &config).await,
        Commands::Conflict(cmd) => cmd.run(&cache).await,
        Commands::Failed(cmd) => cmd.run(&cache).await,
        Commands::Config(_) => Ok(()),
    };

    // Auto-sync AFTER write commands (only if command succeeded)
    if result.is_ok() && is_write_command(command) {
        try_auto_sync(&cache, &config).await;
    }

    result
}

/// Returns true if the command is a read operation that should sync before execution.
fn is_read_command(cmd: &Commands) -> bool {
    match cmd {
        Commands::Recipe(c) => !c.command.is_write(),
        Commands::Session(c) => !c.command.is_write(),
        Commands::Ferment(c) => !c.command.is_write(),
        _ => false,
    }
}

/// Returns true if the command is a write operation that should sync after execution.
fn is_write_command(cmd: &Commands) -> bool {
    match cmd {
        Commands::Recipe(c) => c.command.is_write(),
        Commands::Session(c) => c.command.is_write(),
        Commands::Ferment(c) => c.command.is_write(),
        Commands::Conflict(c) => c.command.is_write(),
        Commands::Failed(c) => c.command.is_write(),
        Commands::Sync(_) | Commands::Config(_) => false,
    }
}
