use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{new_local_id, Entity, EntityType, Record};
use crate::error::ValidationError;

/// A single fermentation reading recorded against a brew session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FermentationEntry {
    pub id: String,
    pub user_id: String,
    pub brew_session_id: String,
    pub entry_date: DateTime<Utc>,
    /// Degrees Celsius.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub gravity: Option<f64>,
    #[serde(default)]
    pub ph: Option<f64>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FermentationEntry {
    pub fn new(brew_session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_local_id(),
            user_id: user_id.into(),
            brew_session_id: brew_session_id.into(),
            entry_date: now,
            temperature: None,
            gravity: None,
            ph: None,
            notes: String::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_gravity(mut self, gravity: f64) -> Self {
        self.gravity = Some(gravity);
        self
    }

    pub fn with_temperature(mut self, celsius: f64) -> Self {
        self.temperature = Some(celsius);
        self
    }

    pub fn with_ph(mut self, ph: f64) -> Self {
        self.ph = Some(ph);
        self
    }
}

impl Record for FermentationEntry {
    const ENTITY_TYPE: EntityType = EntityType::FermentationEntry;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn set_user_id(&mut self, user_id: String) {
        self.user_id = user_id;
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn set_timestamps(&mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>) {
        self.created_at = created_at;
        self.updated_at = updated_at;
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.brew_session_id.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "brew_session_id",
            });
        }
        if matches!(self.gravity, Some(g) if g <= 0.0) {
            return Err(ValidationError::out_of_range(
                "gravity",
                "must be greater than 0",
            ));
        }
        if matches!(self.ph, Some(ph) if !(0.0..=14.0).contains(&ph)) {
            return Err(ValidationError::out_of_range(
                "ph",
                "must be between 0 and 14",
            ));
        }
        Ok(())
    }

    fn remap_reference(&mut self, from: &str, to: &str) -> bool {
        if self.brew_session_id == from {
            self.brew_session_id = to.to_string();
            true
        } else {
            false
        }
    }

    fn into_entity(self) -> Entity {
        Entity::FermentationEntry(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::FermentationEntry(entry) => Some(entry),
            _ => None,
        }
    }
}

impl fmt::Display for FermentationEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.entry_date.format("%Y-%m-%d %H:%M"))?;
        if let Some(gravity) = self.gravity {
            write!(f, "  SG {:.3}", gravity)?;
        }
        if let Some(temp) = self.temperature {
            write!(f, "  {:.1}°C", temp)?;
        }
        if let Some(ph) = self.ph {
            write!(f, "  pH {:.2}", ph)?;
        }
        if !self.notes.is_empty() {
            write!(f, "  {}", self.notes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_ph_range() {
        let entry = FermentationEntry::new("s1", "user1").with_ph(15.0);
        assert!(matches!(
            entry.validate(),
            Err(ValidationError::OutOfRange { field: "ph", .. })
        ));
    }

    #[test]
    fn test_validate_requires_session() {
        let entry = FermentationEntry::new("", "user1");
        assert!(entry.validate().is_err());
    }

    #[test]
    fn test_display() {
        let entry = FermentationEntry::new("s1", "user1")
            .with_gravity(1.012)
            .with_temperature(19.5);
        let output = format!("{}", entry);
        assert!(output.contains("SG 1.012"));
        assert!(output.contains("19.5°C"));
    }

    #[test]
    fn test_remap_reference() {
        let mut entry = FermentationEntry::new("local-s", "user1");
        assert!(entry.remap_reference("local-s", "srv-9"));
        assert_eq!(entry.brew_session_id, "srv-9");
    }
}
