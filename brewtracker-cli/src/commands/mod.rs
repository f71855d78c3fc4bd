mod config_cmd;
mod conflict;
mod failed;
mod ferment;
mod recipe;
mod session;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use conflict::ConflictCommand;
pub use failed::FailedCommand;
pub use ferment::{FermentCommand, FermentSubcommand};
pub use recipe::{RecipeCommand, RecipeSubcommand};
pub use session::{SessionCommand, SessionSubcommand};
pub use sync_cmd::SyncCommand;

use brewtracker_core::{EntityType, Record, UserData};
use clap::ValueEnum;
use std::io::{self, Write};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Finds a record by exact id, then by case-insensitive name.
pub(crate) fn find<T: Record>(
    records: &[T],
    identifier: &str,
    name_of: impl Fn(&T) -> &str,
) -> Option<T> {
    records
        .iter()
        .find(|r| r.id() == identifier)
        .or_else(|| {
            records
                .iter()
                .find(|r| name_of(r).eq_ignore_ascii_case(identifier))
        })
        .cloned()
}

pub(crate) fn require<T: Record>(
    data: &UserData<T>,
    identifier: &str,
    name_of: impl Fn(&T) -> &str,
) -> Result<T, Box<dyn std::error::Error>> {
    find(&data.data(), identifier, name_of)
        .ok_or_else(|| format!("{} not found: {}", label(T::ENTITY_TYPE), identifier).into())
}

pub(crate) fn label(entity_type: EntityType) -> &'static str {
    match entity_type {
        EntityType::Recipe => "Recipe",
        EntityType::BrewSession => "Brew session",
        EntityType::FermentationEntry => "Fermentation entry",
    }
}

/// Asks a yes/no question on stdin.
pub(crate) fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} [y/N] ", prompt);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Truncates `s` to `width` characters for table output.
pub(crate) fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() > width {
        let head: String = s.chars().take(width.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}
