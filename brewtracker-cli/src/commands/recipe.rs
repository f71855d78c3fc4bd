use brewtracker_core::{use_recipes, IngredientKind, Recipe, RecipeIngredient, UserCache};
use clap::{Args, Subcommand};
use std::sync::Arc;

use super::{confirm, require, truncate, OutputFormat};
use crate::config::Config;

#[derive(Args)]
pub struct RecipeCommand {
    #[command(subcommand)]
    pub command: RecipeSubcommand,
}

#[derive(Subcommand)]
pub enum RecipeSubcommand {
    /// Add a new recipe
    Add {
        /// Name of the recipe
        name: String,

        /// Beer style
        #[arg(long)]
        style: Option<String>,

        /// Batch size
        #[arg(long)]
        batch_size: Option<f64>,

        /// Unit of the batch size
        #[arg(long, default_value = "l")]
        unit: String,

        /// Mash efficiency, percent
        #[arg(long)]
        efficiency: Option<f64>,

        /// Boil time in minutes
        #[arg(long)]
        boil_time: Option<i32>,

        /// Ingredient as KIND:NAME:AMOUNT:UNIT[:MINUTES] (can be repeated)
        #[arg(long = "ingredient", value_name = "INGREDIENT", value_parser = parse_ingredient)]
        ingredients: Vec<RecipeIngredient>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List all recipes
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a recipe's details
    Show {
        /// Recipe ID or name
        identifier: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Update an existing recipe
    Update {
        /// Recipe ID or name
        identifier: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        style: Option<String>,

        #[arg(long)]
        efficiency: Option<f64>,

        #[arg(long)]
        boil_time: Option<i32>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Delete a recipe
    Delete {
        /// Recipe ID or name
        identifier: String,

        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Copy a recipe into a new, unsynced recipe
    Clone {
        /// Recipe ID or name
        identifier: String,
    },
}

impl RecipeSubcommand {
    pub fn is_write(&self) -> bool {
        !matches!(self, RecipeSubcommand::List { .. } | RecipeSubcommand::Show { .. })
    }
}

fn parse_ingredient(s: &str) -> Result<RecipeIngredient, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 4 || parts.len() > 5 {
        return Err("expected KIND:NAME:AMOUNT:UNIT[:MINUTES]".to_string());
    }

    let kind = match parts[0].to_lowercase().as_str() {
        "grain" => IngredientKind::Grain,
        "hop" => IngredientKind::Hop,
        "yeast" => IngredientKind::Yeast,
        "other" => IngredientKind::Other,
        other => return Err(format!("unknown ingredient kind: {}", other)),
    };
    let amount: f64 = parts[2]
        .parse()
        .map_err(|_| format!("invalid amount: {}", parts[2]))?;

    let mut ingredient = RecipeIngredient::new(parts[1], kind, amount, parts[3]);
    if let Some(minutes) = parts.get(4) {
        let minutes = minutes
            .parse()
            .map_err(|_| format!("invalid time: {}", minutes))?;
        ingredient = ingredient.with_time(minutes);
    }
    Ok(ingredient)
}

impl RecipeCommand {
    pub async fn run(
        &self,
        cache: Arc<UserCache>,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let recipes = use_recipes(cache).await;

        match &self.command {
            RecipeSubcommand::Add {
                name,
                style,
                batch_size,
                unit,
                efficiency,
                boil_time,
                ingredients,
                notes,
            } => {
                if name.trim().is_empty() {
                    return Err("Recipe name cannot be empty".into());
                }

                let mut recipe = Recipe::new(name.trim(), &config.user_id.value)
                    .with_ingredients(ingredients.clone());
                if let Some(style) = style {
                    recipe = recipe.with_style(style);
                }
                if let Some(size) = batch_size {
                    recipe = recipe.with_batch_size(*size, unit);
                }
                if let Some(efficiency) = efficiency {
                    recipe = recipe.with_efficiency(*efficiency);
                }
                if let Some(minutes) = boil_time {
                    recipe = recipe.with_boil_time(*minutes);
                }
                if let Some(notes) = notes {
                    recipe.notes = notes.clone();
                }

                let created = recipes.create(recipe).await?;
                println!("Created recipe:");
                println!("{}", created);
                Ok(())
            }

            RecipeSubcommand::List { format } => {
                let data = recipes.data();
                if data.is_empty() {
                    println!("No recipes found");
                    return Ok(());
                }

                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&data)?);
                    }
                    OutputFormat::Text => {
                        println!("{:<42}  {:<30}  {:<8}  STYLE", "ID", "NAME", "STATE");
                        println!("{}", "-".repeat(100));
                        for recipe in &data {
                            println!(
                                "{:<42}  {:<30}  {:<8}  {}",
                                recipe.id,
                                truncate(&recipe.name, 30),
                                recipes.sync_state(&recipe.id).await.to_string(),
                                recipe.style
                            );
                        }
                        println!("\nTotal: {} recipe(s)", data.len());
                        if recipes.pending_count() > 0 {
                            println!("Pending changes: {}", recipes.pending_count());
                        }
                    }
                }
                Ok(())
            }

            RecipeSubcommand::Show { identifier, format } => {
                let recipe = require(&recipes, identifier, |r| &r.name)?;
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&recipe)?);
                    }
                    OutputFormat::Text => {
                        println!("{}", recipe);
                        println!("Sync state: {}", recipes.sync_state(&recipe.id).await);
                    }
                }
                Ok(())
            }

            RecipeSubcommand::Update {
                identifier,
                name,
                style,
                efficiency,
                boil_time,
                notes,
            } => {
                let has_updates = name.is_some()
                    || style.is_some()
                    || efficiency.is_some()
                    || boil_time.is_some()
                    || notes.is_some();
                if !has_updates {
                    return Err("Nothing to update. Provide at least one option.".into());
                }

                let recipe = require(&recipes, identifier, |r| &r.name)?;
                let updated = recipes
                    .update_with(&recipe.id, |r| {
                        if let Some(name) = name {
                            r.name = name.clone();
                        }
                        if let Some(style) = style {
                            r.style = style.clone();
                        }
                        if efficiency.is_some() {
                            r.efficiency = *efficiency;
                        }
                        if boil_time.is_some() {
                            r.boil_time = *boil_time;
                        }
                        if let Some(notes) = notes {
                            r.notes = notes.clone();
                        }
                    })
                    .await?;
                println!("Updated recipe:");
                println!("{}", updated);
                Ok(())
            }

            RecipeSubcommand::Delete { identifier, force } => {
                let recipe = require(&recipes, identifier, |r| &r.name)?;
                if !force && !confirm(&format!("Delete recipe '{}'?", recipe.name))? {
                    println!("Deletion cancelled.");
                    return Ok(());
                }

                recipes.delete(&recipe.id).await?;
                println!("Deleted recipe: {}", recipe.name);
                Ok(())
            }

            RecipeSubcommand::Clone { identifier } => {
                let recipe = require(&recipes, identifier, |r| &r.name)?;
                let copy = recipes.clone_entity(&recipe.id).await?;
                println!("Cloned '{}' as {}", recipe.name, copy.id);
                Ok(())
            }
        }
    }
}
