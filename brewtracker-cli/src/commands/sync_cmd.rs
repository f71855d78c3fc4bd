//! Sync CLI commands for reconciling the local cache with the server.

use brewtracker_core::{SyncReport, UserCache};
use clap::{Args, Subcommand};

use crate::config::Config;

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration and queue status
    Status,
    /// Pull server changes without sending local ones
    Pull,
}

impl SyncCommand {
    pub async fn run(
        &self,
        cache: &UserCache,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            None => self.sync(cache, config).await,
            Some(SyncSubcommand::Pull) => self.pull(cache, config).await,
            Some(SyncSubcommand::Status) => self.status(cache, config).await,
        }
    }

    async fn sync(
        &self,
        cache: &UserCache,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            return Err("Sync is not configured. Run `brew sync status` for details.".into());
        }

        println!("Syncing with server...");
        println!();
        let report = cache.sync().await;
        print_report(&report);
        finish(&report)
    }

    async fn pull(
        &self,
        cache: &UserCache,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        if !config.sync.is_configured() {
            return Err("Sync is not configured. Run `brew sync status` for details.".into());
        }

        println!("Pulling from server...");
        println!();
        let report = cache.refresh().await;
        print_report(&report);
        finish(&report)
    }

    async fn status(
        &self,
        cache: &UserCache,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        match (&config.sync.server_url, &config.sync.api_key) {
            (Some(server_url), Some(api_key)) => {
                println!("Server:    {}", server_url);
                println!("API Key:   {}...", api_key.chars().take(8).collect::<String>());
                println!(
                    "Auto-sync: {}",
                    if config.sync.auto_sync {
                        "enabled"
                    } else {
                        "disabled"
                    }
                );
                println!("Conflicts: {}", config.sync.conflict_policy);
            }
            _ => {
                println!("Status: Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"http://localhost:8080\"");
                println!("    api_key: \"your-api-key\"");
                println!("    auto_sync: false");
                println!();
                println!("Or set environment variables:");
                println!("  BREW_SYNC_URL");
                println!("  BREW_SYNC_API_KEY");
            }
        }
        println!();

        let status = cache.status().await;
        println!("User:      {}", cache.user_id());
        println!("Pending:   {}", status.pending);
        println!("Failed:    {}", status.failed);
        println!("Conflicts: {}", status.conflicts);
        match status.last_sync {
            Some(at) => println!("Last sync: {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("Last sync: never"),
        }
        if let Some(cursor) = status.cursor {
            println!("Cursor:    {}", cursor);
        }
        Ok(())
    }
}

fn print_report(report: &SyncReport) {
    println!("  ✓ sent      {}", report.pushed);
    println!("  ✓ received  {}", report.pulled);
    if report.retried > 0 {
        println!("  … retrying  {}", report.retried);
    }
    if report.failed > 0 {
        println!("  ✗ failed    {}", report.failed);
    }
    if report.conflicted > 0 {
        println!("  ! conflicts {}", report.conflicted);
    }
    println!();
}

fn finish(report: &SyncReport) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(e) = &report.pull_error {
        return Err(format!("Could not pull changes: {}", e).into());
    }
    if let Some(e) = &report.storage_error {
        return Err(format!("Could not save sync state: {}", e).into());
    }

    if report.failed > 0 {
        println!("Some changes were rejected. See `brew failed list`.");
    } else if report.conflicted > 0 {
        println!("Conflicts need attention. See `brew conflict list`.");
    } else if report.retried > 0 {
        println!("Some changes are still queued and will be retried.");
    } else {
        println!("Sync complete.");
    }
    Ok(())
}
