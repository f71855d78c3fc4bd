use clap::{Args, Subcommand};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Initialize configuration file
    Init,
}

const DEFAULT_CONFIG: &str = r#"# brewtracker configuration

# Path to the SQLite cache (default: ~/.local/share/brewtracker/brew.db)
# database_path: ~/.local/share/brewtracker/brew.db

# Whose records this device caches
user_id: default

# sync:
#   server_url: "http://localhost:8080"
#   api_key: "your-api-key"
#   auto_sync: false
#   request_timeout_secs: 30
#   max_attempts: 5
#   conflict_policy: manual   # manual, prefer_server or prefer_local
"#;

fn mask(api_key: &str) -> String {
    format!("{}...", api_key.chars().take(8).collect::<String>())
}

/// Config as JSON with the API key shortened.
fn redacted_json(config: &Config) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(config)?;
    let masked = match value.pointer("/sync/api_key") {
        Some(Value::String(s)) => Some(mask(s)),
        _ => None,
    };
    if let Some(masked) = masked {
        value["sync"]["api_key"] = Value::String(masked);
    }
    Ok(value)
}

impl ConfigCommand {
    pub fn run(
        &self,
        config: &Config,
        cli_config_path: Option<PathBuf>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&redacted_json(config)?)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("database_path: {}", config.database_path.value.display());
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!("user_id: {}", config.user_id.value);
                        println!("  source: {}", config.user_id.source);
                        println!();

                        println!("sync:");
                        println!(
                            "  server_url: {}",
                            config.sync.server_url.as_deref().unwrap_or("(not set)")
                        );
                        println!(
                            "  api_key: {}",
                            config
                                .sync
                                .api_key
                                .as_deref()
                                .map(mask)
                                .unwrap_or_else(|| "(not set)".to_string())
                        );
                        println!("  auto_sync: {}", config.sync.auto_sync);
                        println!(
                            "  request_timeout_secs: {}",
                            config.sync.request_timeout_secs
                        );
                        println!("  max_attempts: {}", config.sync.max_attempts);
                        println!("  conflict_policy: {}", config.sync.conflict_policy);
                    }
                }
                Ok(())
            }

            ConfigSubcommand::Init => {
                let config_path = cli_config_path.unwrap_or_else(Config::default_config_path);

                if config_path.exists() {
                    println!("Config file already exists: {}", config_path.display());
                    println!("Use 'brew config show' to view current configuration.");
                    return Ok(());
                }

                if let Some(parent) = config_path.parent() {
                    fs::create_dir_all(parent)?;
                }

                let mut file = fs::File::create(&config_path)?;
                file.write_all(DEFAULT_CONFIG.as_bytes())?;

                println!("Created config file: {}", config_path.display());
                println!("\nEdit this file to customize your settings.");
                Ok(())
            }
        }
    }
}
