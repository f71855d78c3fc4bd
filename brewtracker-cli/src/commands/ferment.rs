use brewtracker_core::{use_brew_sessions, use_fermentation_entries, FermentationEntry, UserCache};
use clap::{Args, Subcommand};
use std::sync::Arc;

use super::{require, OutputFormat};
use crate::config::Config;

#[derive(Args)]
pub struct FermentCommand {
    #[command(subcommand)]
    pub command: FermentSubcommand,
}

#[derive(Subcommand)]
pub enum FermentSubcommand {
    /// Record a fermentation reading
    Add {
        /// Brew session ID or name
        session: String,

        /// Specific gravity, e.g. 1.012
        #[arg(long, short)]
        gravity: Option<f64>,

        /// Temperature in degrees Celsius
        #[arg(long, short)]
        temperature: Option<f64>,

        #[arg(long)]
        ph: Option<f64>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List the readings of a brew session
    List {
        /// Brew session ID or name
        session: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete a reading
    Delete {
        /// Fermentation entry ID
        id: String,
    },
}

impl FermentSubcommand {
    pub fn is_write(&self) -> bool {
        !matches!(self, FermentSubcommand::List { .. })
    }
}

fn fmt_reading(value: Option<f64>, precision: usize) -> String {
    value
        .map(|v| format!("{:.*}", precision, v))
        .unwrap_or_else(|| "-".to_string())
}

impl FermentCommand {
    pub async fn run(
        &self,
        cache: Arc<UserCache>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let entries = use_fermentation_entries(cache.clone()).await;

        match &self.command {
            FermentSubcommand::Add {
                session,
                gravity,
                temperature,
                ph,
                notes,
            } => {
                if gravity.is_none() && temperature.is_none() && ph.is_none() {
                    return Err("Provide at least one of --gravity, --temperature or --ph".into());
                }

                let sessions = use_brew_sessions(cache).await;
                let session = require(&sessions, session, |s| &s.name)?;

                let mut entry = FermentationEntry::new(&session.id, &config.user_id.value);
                if let Some(gravity) = gravity {
                    entry = entry.with_gravity(*gravity);
                }
                if let Some(celsius) = temperature {
                    entry = entry.with_temperature(*celsius);
                }
                if let Some(ph) = ph {
                    entry = entry.with_ph(*ph);
                }
                if let Some(notes) = notes {
                    entry.notes = notes.clone();
                }

                let created = entries.create(entry).await?;
                println!("Recorded reading for '{}':", session.name);
                println!("{}", created);
                Ok(())
            }

            FermentSubcommand::List { session, format } => {
                let sessions = use_brew_sessions(cache).await;
                let session = require(&sessions, session, |s| &s.name)?;

                let mut data: Vec<FermentationEntry> = entries
                    .data()
                    .into_iter()
                    .filter(|e| e.brew_session_id == session.id)
                    .collect();
                data.sort_by_key(|e| e.entry_date);

                if data.is_empty() {
                    println!("No readings for '{}'", session.name);
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&data)?);
                    }
                    OutputFormat::Text => {
                        println!("Readings for '{}'", session.name);
                        println!(
                            "{:<42}  {:<16}  {:>7}  {:>6}  {:>4}  STATE",
                            "ID", "DATE", "GRAVITY", "TEMP", "PH"
                        );
                        println!("{}", "-".repeat(96));
                        for entry in &data {
                            println!(
                                "{:<42}  {:<16}  {:>7}  {:>6}  {:>4}  {}",
                                entry.id,
                                entry.entry_date.format("%Y-%m-%d %H:%M"),
                                fmt_reading(entry.gravity, 3),
                                fmt_reading(entry.temperature, 1),
                                fmt_reading(entry.ph, 1),
                                entries.sync_state(&entry.id).await
                            );
                        }
                    }
                }
                Ok(())
            }

            FermentSubcommand::Delete { id } => {
                if entries.delete(id).await? {
                    println!("Deleted reading {}", id);
                    Ok(())
                } else {
                    Err(format!("Fermentation entry not found: {}", id).into())
                }
            }
        }
    }
}
