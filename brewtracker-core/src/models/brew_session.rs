use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{new_local_id, Entity, EntityType, Record};
use crate::error::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrewSessionStatus {
    #[default]
    Planned,
    InProgress,
    Fermenting,
    Conditioning,
    Completed,
    Failed,
}

impl BrewSessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrewSessionStatus::Planned => "planned",
            BrewSessionStatus::InProgress => "in_progress",
            BrewSessionStatus::Fermenting => "fermenting",
            BrewSessionStatus::Conditioning => "conditioning",
            BrewSessionStatus::Completed => "completed",
            BrewSessionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BrewSessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrewSessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "planned" => Ok(BrewSessionStatus::Planned),
            "in_progress" => Ok(BrewSessionStatus::InProgress),
            "fermenting" => Ok(BrewSessionStatus::Fermenting),
            "conditioning" => Ok(BrewSessionStatus::Conditioning),
            "completed" => Ok(BrewSessionStatus::Completed),
            "failed" => Ok(BrewSessionStatus::Failed),
            _ => Err(format!("Invalid brew session status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrewSession {
    pub id: String,
    pub user_id: String,
    pub recipe_id: String,
    pub name: String,
    #[serde(default)]
    pub status: BrewSessionStatus,
    #[serde(default)]
    pub brew_date: Option<NaiveDate>,
    #[serde(default)]
    pub actual_og: Option<f64>,
    #[serde(default)]
    pub actual_fg: Option<f64>,
    #[serde(default)]
    pub actual_abv: Option<f64>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BrewSession {
    pub fn new(
        name: impl Into<String>,
        recipe_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_local_id(),
            user_id: user_id.into(),
            recipe_id: recipe_id.into(),
            name: name.into(),
            status: BrewSessionStatus::Planned,
            brew_date: None,
            actual_og: None,
            actual_fg: None,
            actual_abv: None,
            notes: String::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_status(mut self, status: BrewSessionStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_brew_date(mut self, date: NaiveDate) -> Self {
        self.brew_date = Some(date);
        self
    }
}

impl Record for BrewSession {
    const ENTITY_TYPE: EntityType = EntityType::BrewSession;

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
        if self.name.trim().is_empty() {
            return Err(ValidationError::Required { field: "name" });
        }
        if self.recipe_id.trim().is_empty() {
            return Err(ValidationError::Required { field: "recipe_id" });
        }
        for (field, gravity) in [("actual_og", self.actual_og), ("actual_fg", self.actual_fg)] {
            if matches!(gravity, Some(g) if g <= 0.0) {
                return Err(ValidationError::out_of_range(
                    field,
                    "must be greater than 0",
                ));
            }
        }
        Ok(())
    }

    fn remap_reference(&mut self, from: &str, to: &str) -> bool {
        if self.recipe_id == from {
            self.recipe_id = to.to_string();
            true
        } else {
            false
        }
    }

    fn prepare_copy(&mut self) {
        self.name = format!("{} (Copy)", self.name);
        self.status = BrewSessionStatus::Planned;
        self.actual_og = None;
        self.actual_fg = None;
        self.actual_abv = None;
    }

    fn into_entity(self) -> Entity {
        Entity::BrewSession(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::BrewSession(session) => Some(session),
            _ => None,
        }
    }
}

impl fmt::Display for BrewSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} [{}]", self.name, self.status)?;
        writeln!(f, "{}", "=".repeat(30))?;
        writeln!(f, "Recipe: {}", self.recipe_id)?;
        if let Some(date) = self.brew_date {
            writeln!(f, "Brew date: {}", date)?;
        }
        if let Some(og) = self.actual_og {
            writeln!(f, "OG: {:.3}", og)?;
        }
        if let Some(fg) = self.actual_fg {
            writeln!(f, "FG: {:.3}", fg)?;
        }
        if let Some(abv) = self.actual_abv {
            writeln!(f, "ABV: {:.1}%", abv)?;
        }
        if !self.notes.is_empty() {
            writeln!(f, "\nNotes:\n{}", self.notes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_str() {
        assert_eq!(
            "in-progress".parse::<BrewSessionStatus>().unwrap(),
            BrewSessionStatus::InProgress
        );
        assert_eq!(
            "FERMENTING".parse::<BrewSessionStatus>().unwrap(),
            BrewSessionStatus::Fermenting
        );
        assert!("bottled".parse::<BrewSessionStatus>().is_err());
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&BrewSessionStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn test_validate_requires_recipe() {
        let session = BrewSession::new("IPA Brew", "", "user1");
        assert_eq!(
            session.validate(),
            Err(ValidationError::Required { field: "recipe_id" })
        );
    }

    #[test]
    fn test_validate_gravity() {
        let mut session = BrewSession::new("IPA Brew", "r1", "user1");
        session.actual_og = Some(0.0);
        assert!(session.validate().is_err());
        session.actual_og = Some(1.062);
        assert!(session.validate().is_ok());
    }

    #[test]
    fn test_remap_reference() {
        let mut session = BrewSession::new("IPA Brew", "local-abc", "user1");
        assert!(session.remap_reference("local-abc", "srv-1"));
        assert_eq!(session.recipe_id, "srv-1");
        assert!(!session.remap_reference("local-abc", "srv-2"));
    }

    #[test]
    fn test_prepare_copy_resets_progress() {
        let mut session =
            BrewSession::new("IPA Brew", "r1", "user1").with_status(BrewSessionStatus::Completed);
        session.actual_og = Some(1.060);
        session.prepare_copy();
        assert_eq!(session.status, BrewSessionStatus::Planned);
        assert_eq!(session.actual_og, None);
        assert_eq!(session.name, "IPA Brew (Copy)");
    }
}
