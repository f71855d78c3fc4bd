use brewtracker_core::{
    use_brew_sessions, use_recipes, BrewSession, BrewSessionStatus, UserCache,
};
use chrono::{Local, NaiveDate};
use clap::{Args, Subcommand};
use std::sync::Arc;

use super::{confirm, require, truncate, OutputFormat};
use crate::config::Config;

#[derive(Args)]
pub struct SessionCommand {
    #[command(subcommand)]
    pub command: SessionSubcommand,
}

#[derive(Subcommand)]
pub enum SessionSubcommand {
    /// Plan a new brew session
    Add {
        /// Name of the brew session
        name: String,

        /// Recipe ID or name
        #[arg(long, short)]
        recipe: String,

        /// Brew date (YYYY-MM-DD), defaults to today
        #[arg(long, short)]
        date: Option<String>,
    },

    /// List brew sessions
    List {
        /// Only sessions brewed from this recipe (ID or name)
        #[arg(long, short)]
        recipe: Option<String>,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a brew session's details
    Show {
        /// Brew session ID or name
        identifier: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Move a brew session to a new status
    Status {
        /// Brew session ID or name
        identifier: String,

        /// planned, in_progress, fermenting, conditioning, completed or failed
        status: BrewSessionStatus,

        /// Measured original gravity
        #[arg(long)]
        og: Option<f64>,

        /// Measured final gravity
        #[arg(long)]
        fg: Option<f64>,
    },

    /// Delete a brew session
    Delete {
        /// Brew session ID or name
        identifier: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },
}

impl SessionSubcommand {
    pub fn is_write(&self) -> bool {
        !matches!(self, SessionSubcommand::List { .. } | SessionSubcommand::Show { .. })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}'. Use YYYY-MM-DD format.", s))
}

/// Classic ABV estimate from original and final gravity.
fn abv(og: f64, fg: f64) -> f64 {
    ((og - fg) * 131.25 * 100.0).round() / 100.0
}

impl SessionCommand {
    pub async fn run(
        &self,
        cache: Arc<UserCache>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let sessions = use_brew_sessions(cache.clone()).await;

        match &self.command {
            SessionSubcommand::Add { name, recipe, date } => {
                if name.trim().is_empty() {
                    return Err("Brew session name cannot be empty".into());
                }

                let recipes = use_recipes(cache).await;
                let recipe = require(&recipes, recipe, |r| &r.name)?;
                let brew_date = match date {
                    Some(d) => parse_date(d)?,
                    None => Local::now().date_naive(),
                };

                let session = BrewSession::new(name.trim(), &recipe.id, &config.user_id.value)
                    .with_brew_date(brew_date);
                let created = sessions.create(session).await?;
                println!("Created brew session:");
                println!("{}", created);
                Ok(())
            }

            SessionSubcommand::List { recipe, format } => {
                let mut data = sessions.data();
                if let Some(recipe) = recipe {
                    let recipes = use_recipes(cache).await;
                    let recipe = require(&recipes, recipe, |r| &r.name)?;
                    data.retain(|s| s.recipe_id == recipe.id);
                }
                data.sort_by(|a, b| b.brew_date.cmp(&a.brew_date));

                if data.is_empty() {
                    println!("No brew sessions found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&data)?);
                    }
                    OutputFormat::Text => {
                        println!(
                            "{:<42}  {:<24}  {:<10}  {:<12}  STATE",
                            "ID", "NAME", "DATE", "STATUS"
                        );
                        println!("{}", "-".repeat(104));
                        for session in &data {
                            let date = session
                                .brew_date
                                .map(|d| d.to_string())
                                .unwrap_or_else(|| "-".to_string());
                            println!(
                                "{:<42}  {:<24}  {:<10}  {:<12}  {}",
                                session.id,
                                truncate(&session.name, 24),
                                date,
                                session.status.as_str(),
                                sessions.sync_state(&session.id).await
                            );
                        }
                        println!("\nTotal: {} brew session(s)", data.len());
                    }
                }
                Ok(())
            }

            SessionSubcommand::Show { identifier, format } => {
                let session = require(&sessions, identifier, |s| &s.name)?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&session)?);
                    }
                    OutputFormat::Text => {
                        println!("{}", session);
                        println!("Sync state: {}", sessions.sync_state(&session.id).await);
                    }
                }
                Ok(())
            }

            SessionSubcommand::Status {
                identifier,
                status,
                og,
                fg,
            } => {
                let session = require(&sessions, identifier, |s| &s.name)?;
                let updated = sessions
                    .update_with(&session.id, |s| {
                        s.status = *status;
                        if og.is_some() {
                            s.actual_og = *og;
                        }
                        if fg.is_some() {
                            s.actual_fg = *fg;
                        }
                        if let (Some(og), Some(fg)) = (s.actual_og, s.actual_fg) {
                            s.actual_abv = Some(abv(og, fg));
                        }
                    })
                    .await?;
                println!("Updated brew session:");
                println!("{}", updated);
                Ok(())
            }

            SessionSubcommand::Delete { identifier, force } => {
                let session = require(&sessions, identifier, |s| &s.name)?;
                if !force && !confirm(&format!("Delete brew session '{}'?", session.name))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }

                sessions.delete(&session.id).await?;
                println!("Deleted brew session: {}", session.name);
                Ok(())
            }
        }
    }
}
