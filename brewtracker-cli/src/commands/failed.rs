use brewtracker_core::{OperationKind, PendingOperation, UserCache};
use clap::{Args, Subcommand};

use super::{label, truncate, OutputFormat};

#[derive(Args)]
pub struct FailedCommand {
    #[command(subcommand)]
    pub command: FailedSubcommand,
}

#[derive(Subcommand)]
pub enum FailedSubcommand {
    /// List changes the server rejected or that ran out of retries
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Queue a failed change for another attempt
    Retry {
        /// Operation ID
        op_id: String,
    },

    /// Drop a failed change for good
    Discard {
        /// Operation ID
        op_id: String,
    },
}

impl FailedSubcommand {
    pub fn is_write(&self) -> bool {
        !matches!(self, FailedSubcommand::List { .. })
    }
}

fn kind_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Create => "create",
        OperationKind::Update => "update",
        OperationKind::Delete => "delete",
    }
}

fn describe(op: &PendingOperation) -> String {
    format!(
        "{} {} {}",
        kind_name(op.kind),
        label(op.entity_type).to_lowercase(),
        op.entity_id
    )
}

impl FailedCommand {
    pub async fn run(&self, cache: &UserCache) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            FailedSubcommand::List { format } => {
                let ops = cache.failed_operations().await;
                if ops.is_empty() {
                    println!("No failed changes");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&ops)?);
                    }
                    OutputFormat::Text => {
                        println!(
                            "{:<36}  {:<60}  {:>8}  ERROR",
                            "ID", "CHANGE", "ATTEMPTS"
                        );
                        println!("{}", "-".repeat(120));
                        for op in &ops {
                            println!(
                                "{:<36}  {:<60}  {:>8}  {}",
                                op.id,
                                truncate(&describe(op), 60),
                                op.attempt_count,
                                op.last_error.as_deref().unwrap_or("-")
                            );
                        }
                        println!("\nTotal: {} failed change(s)", ops.len());
                    }
                }
                Ok(())
            }

            FailedSubcommand::Retry { op_id } => {
                if cache.retry_failed(op_id).await {
                    println!("Queued {} for the next sync.", op_id);
                    Ok(())
                } else {
                    Err(format!("No failed change with ID: {}", op_id).into())
                }
            }

            FailedSubcommand::Discard { op_id } => match cache.discard_failed(op_id).await {
                Some(op) => {
                    println!("Discarded: {}", describe(&op));
                    if op.kind == OperationKind::Create {
                        println!("The unsynced record was removed from this device.");
                    }
                    Ok(())
                }
                None => Err(format!("No failed change with ID: {}", op_id).into()),
            },
        }
    }
}
