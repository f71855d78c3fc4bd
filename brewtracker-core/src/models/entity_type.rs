//! Entity type enumeration used for storage keys and remote routes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kinds of records held by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "recipes")]
    Recipe,
    #[serde(rename = "brew_sessions")]
    BrewSession,
    #[serde(rename = "fermentation_entries")]
    FermentationEntry,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [
        EntityType::Recipe,
        EntityType::BrewSession,
        EntityType::FermentationEntry,
    ];

    /// Returns the plural name used in storage keys and URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Recipe => "recipes",
            EntityType::BrewSession => "brew_sessions",
            EntityType::FermentationEntry => "fermentation_entries",
        }
    }

    /// Parse from string name.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "recipes" | "recipe" => Some(EntityType::Recipe),
            "brew_sessions" | "brew_session" | "sessions" => Some(EntityType::BrewSession),
            "fermentation_entries" | "fermentation_entry" | "fermentation" => {
                Some(EntityType::FermentationEntry)
            }
            _ => None,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
