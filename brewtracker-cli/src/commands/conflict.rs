use brewtracker_core::{Conflict, Resolution, UserCache};
use clap::{Args, Subcommand, ValueEnum};
use serde_json::Value;

use super::{label, OutputFormat};

#[derive(Args)]
pub struct ConflictCommand {
    #[command(subcommand)]
    pub command: ConflictSubcommand,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Keep {
    Local,
    Server,
}

#[derive(Subcommand)]
pub enum ConflictSubcommand {
    /// List unresolved conflicts
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Settle one conflict
    Resolve {
        /// ID of the conflicting record
        entity_id: String,

        /// Which side wins
        #[arg(long, value_enum)]
        keep: Keep,
    },

    /// Settle every conflict with the configured conflict policy
    ResolveAll,
}

impl ConflictSubcommand {
    pub fn is_write(&self) -> bool {
        !matches!(self, ConflictSubcommand::List { .. })
    }
}

fn show_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => "-".to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn print_conflict(conflict: &Conflict) {
    println!(
        "{} {} (detected {})",
        label(conflict.entity_type),
        conflict.entity_id,
        conflict.detected_at.format("%Y-%m-%d %H:%M")
    );

    let server_fields = match &conflict.server_snapshot {
        Some(server) => match server.fields() {
            Ok(fields) => Some(fields),
            Err(_) => None,
        },
        None => {
            println!("  deleted on the server");
            None
        }
    };

    for field in conflict.conflicting_fields() {
        let server = server_fields.as_ref().and_then(|f| f.get(&field));
        println!(
            "  {:<16} local: {:<20} server: {}",
            field,
            show_value(conflict.local_patch.get(&field)),
            show_value(server)
        );
    }
}

impl ConflictCommand {
    pub async fn run(&self, cache: &UserCache) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConflictSubcommand::List { format } => {
                let conflicts = cache.conflicts().await;
                if conflicts.is_empty() {
                    println!("No conflicts");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&conflicts)?);
                    }
                    OutputFormat::Text => {
                        for conflict in &conflicts {
                            print_conflict(conflict);
                            println!();
                        }
                        println!("Total: {} conflict(s)", conflicts.len());
                        println!(
                            "Resolve with `brew conflict resolve <id> --keep local|server`."
                        );
                    }
                }
                Ok(())
            }

            ConflictSubcommand::Resolve { entity_id, keep } => {
                let conflict = cache
                    .conflicts()
                    .await
                    .into_iter()
                    .find(|c| &c.entity_id == entity_id)
                    .ok_or_else(|| format!("No conflict for: {}", entity_id))?;

                let resolution = match keep {
                    Keep::Local => Resolution::KeepLocal,
                    Keep::Server => Resolution::KeepServer,
                };
                cache
                    .resolve_conflict(conflict.entity_type, entity_id, resolution)
                    .await?;

                match keep {
                    Keep::Local => println!("Kept local changes; they will be sent on next sync."),
                    Keep::Server => println!("Kept the server version."),
                }
                Ok(())
            }

            ConflictSubcommand::ResolveAll => {
                let policy = cache.config().conflict_policy;
                let resolved = cache.resolve_all().await?;
                if resolved == 0 && cache.conflict_count().await > 0 {
                    println!(
                        "Conflict policy is '{}'; resolve conflicts one by one.",
                        policy
                    );
                } else {
                    println!("Resolved {} conflict(s) with policy '{}'.", resolved, policy);
                }
                Ok(())
            }
        }
    }
}
