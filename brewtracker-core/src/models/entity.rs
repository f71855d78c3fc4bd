//! The `Entity` sum type over every record kind the cache stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{apply_patch, record_fields};
use super::{BrewSession, EntityType, FermentationEntry, Patch, Recipe, Record};
use crate::error::ValidationError;

/// Any record held by the cache, tagged by `entity_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type")]
pub enum Entity {
    #[serde(rename = "recipes")]
    Recipe(Recipe),
    #[serde(rename = "brew_sessions")]
    BrewSession(BrewSession),
    #[serde(rename = "fermentation_entries")]
    FermentationEntry(FermentationEntry),
}

macro_rules! each_record {
    ($entity:expr, $record:ident => $body:expr) => {
        match $entity {
            Entity::Recipe($record) => $body,
            Entity::BrewSession($record) => $body,
            Entity::FermentationEntry($record) => $body,
        }
    };
}

impl Entity {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Entity::Recipe(_) => EntityType::Recipe,
            Entity::BrewSession(_) => EntityType::BrewSession,
            Entity::FermentationEntry(_) => EntityType::FermentationEntry,
        }
    }

    pub fn id(&self) -> &str {
        each_record!(self, r => r.id())
    }

    pub fn set_id(&mut self, id: String) {
        each_record!(self, r => r.set_id(id))
    }

    pub fn user_id(&self) -> &str {
        each_record!(self, r => r.user_id())
    }

    pub fn version(&self) -> u64 {
        each_record!(self, r => r.version())
    }

    pub fn set_version(&mut self, version: u64) {
        each_record!(self, r => r.set_version(version))
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        each_record!(self, r => r.updated_at())
    }

    /// Marks a local edit by advancing `updated_at`.
    pub fn touch(&mut self) {
        each_record!(self, r => {
            let created_at = r.created_at();
            r.set_timestamps(created_at, Utc::now())
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        each_record!(self, r => r.validate())
    }

    pub fn remap_reference(&mut self, from: &str, to: &str) -> bool {
        each_record!(self, r => r.remap_reference(from, to))
    }

    /// Field map of the inner record, without the `entity_type` tag.
    pub fn fields(&self) -> Result<Patch, serde_json::Error> {
        each_record!(self, r => record_fields(r))
    }

    /// Returns a copy with `patch` applied to the inner record.
    pub fn apply_patch(&self, patch: &Patch) -> Result<Entity, ValidationError> {
        Ok(match self {
            Entity::Recipe(r) => Entity::Recipe(apply_patch(r, patch)?),
            Entity::BrewSession(r) => Entity::BrewSession(apply_patch(r, patch)?),
            Entity::FermentationEntry(r) => Entity::FermentationEntry(apply_patch(r, patch)?),
        })
    }

    /// Narrows to a concrete record type.
    pub fn into_record<T: Record>(self) -> Option<T> {
        T::from_entity(self)
    }
}
