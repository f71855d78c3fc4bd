use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ingredient::RecipeIngredient;
use super::{new_local_id, Entity, EntityType, Record};
use crate::error::ValidationError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipe {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub batch_size: Option<f64>,
    #[serde(default)]
    pub batch_size_unit: String,
    /// Mash efficiency, percent.
    #[serde(default)]
    pub efficiency: Option<f64>,
    /// Boil time, minutes.
    #[serde(default)]
    pub boil_time: Option<i32>,
    #[serde(default)]
    pub ingredients: Vec<RecipeIngredient>,
    #[serde(default)]
    pub estimated_og: Option<f64>,
    #[serde(default)]
    pub estimated_fg: Option<f64>,
    #[serde(default)]
    pub estimated_abv: Option<f64>,
    #[serde(default)]
    pub estimated_ibu: Option<f64>,
    #[serde(default)]
    pub estimated_srm: Option<f64>,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipe {
    pub fn new(name: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_local_id(),
            user_id: user_id.into(),
            name: name.into(),
            style: String::new(),
            description: String::new(),
            batch_size: None,
            batch_size_unit: "l".to_string(),
            efficiency: None,
            boil_time: None,
            ingredients: Vec::new(),
            estimated_og: None,
            estimated_fg: None,
            estimated_abv: None,
            estimated_ibu: None,
            estimated_srm: None,
            is_public: false,
            notes: String::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = style.into();
        self
    }

    pub fn with_batch_size(mut self, size: f64, unit: impl Into<String>) -> Self {
        self.batch_size = Some(size);
        self.batch_size_unit = unit.into();
        self
    }

    pub fn with_efficiency(mut self, efficiency: f64) -> Self {
        self.efficiency = Some(efficiency);
        self
    }

    pub fn with_boil_time(mut self, minutes: i32) -> Self {
        self.boil_time = Some(minutes);
        self
    }

    pub fn with_ingredients(mut self, ingredients: Vec<RecipeIngredient>) -> Self {
        self.ingredients = ingredients;
        self
    }
}

impl Record for Recipe {
    const ENTITY_TYPE: EntityType = EntityType::Recipe;

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
        if let Some(size) = self.batch_size {
            if size <= 0.0 {
                return Err(ValidationError::out_of_range(
                    "batch_size",
                    "must be greater than 0",
                ));
            }
        }
        if let Some(efficiency) = self.efficiency {
            if !(0.0..=100.0).contains(&efficiency) {
                return Err(ValidationError::out_of_range(
                    "efficiency",
                    "must be between 0 and 100",
                ));
            }
        }
        if matches!(self.boil_time, Some(t) if t < 0) {
            return Err(ValidationError::out_of_range(
                "boil_time",
                "must not be negative",
            ));
        }
        for ingredient in &self.ingredients {
            if ingredient.name.trim().is_empty() {
                return Err(ValidationError::Required {
                    field: "ingredients.name",
                });
            }
            if ingredient.amount < 0.0 {
                return Err(ValidationError::out_of_range(
                    "ingredients.amount",
                    "must not be negative",
                ));
            }
        }
        Ok(())
    }

    fn prepare_copy(&mut self) {
        self.name = format!("{} (Copy)", self.name);
        self.is_public = false;
    }

    fn into_entity(self) -> Entity {
        Entity::Recipe(self)
    }

    fn from_entity(entity: Entity) -> Option<Self> {
        match entity {
            Entity::Recipe(recipe) => Some(recipe),
            _ => None,
        }
    }
}

impl fmt::Display for Recipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name)?;
        writeln!(f, "{}", "=".repeat(self.name.len()))?;

        if !self.style.is_empty() {
            writeln!(f, "Style: {}", self.style)?;
        }
        if let Some(size) = self.batch_size {
            writeln!(f, "Batch: {} {}", size, self.batch_size_unit)?;
        }
        if let Some(efficiency) = self.efficiency {
            writeln!(f, "Efficiency: {}%", efficiency)?;
        }
        if let Some(boil) = self.boil_time {
            writeln!(f, "Boil: {} min", boil)?;
        }

        let stats: Vec<String> = [
            self.estimated_og.map(|v| format!("OG {:.3}", v)),
            self.estimated_fg.map(|v| format!("FG {:.3}", v)),
            self.estimated_abv.map(|v| format!("ABV {:.1}%", v)),
            self.estimated_ibu.map(|v| format!("IBU {:.0}", v)),
            self.estimated_srm.map(|v| format!("SRM {:.1}", v)),
        ]
        .into_iter()
        .flatten()
        .collect();
        if !stats.is_empty() {
            writeln!(f, "Estimates: {}", stats.join(", "))?;
        }

        if !self.ingredients.is_empty() {
            writeln!(f, "\nIngredients:")?;
            for ingredient in &self.ingredients {
                writeln!(f, "  - {}", ingredient)?;
            }
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
    use crate::models::IngredientKind;

    #[test]
    fn test_recipe_new() {
        let recipe = Recipe::new("Pale Ale", "user1");
        assert_eq!(recipe.name, "Pale Ale");
        assert_eq!(recipe.user_id, "user1");
        assert!(recipe.id.starts_with("local-"));
        assert_eq!(recipe.version, 0);
        assert!(recipe.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_name() {
        let recipe = Recipe::new("  ", "user1");
        assert_eq!(
            recipe.validate(),
            Err(ValidationError::Required { field: "name" })
        );
    }

    #[test]
    fn test_validate_efficiency_range() {
        let recipe = Recipe::new("IPA", "user1").with_efficiency(120.0);
        assert!(matches!(
            recipe.validate(),
            Err(ValidationError::OutOfRange {
                field: "efficiency",
                ..
            })
        ));
    }

    #[test]
    fn test_validate_batch_size() {
        let recipe = Recipe::new("IPA", "user1").with_batch_size(0.0, "l");
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_validate_ingredient_amount() {
        let recipe = Recipe::new("IPA", "user1").with_ingredients(vec![RecipeIngredient::new(
            "Citra",
            IngredientKind::Hop,
            -1.0,
            "g",
        )]);
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn test_prepare_copy() {
        let mut recipe = Recipe::new("Saison", "user1");
        recipe.is_public = true;
        recipe.prepare_copy();
        assert_eq!(recipe.name, "Saison (Copy)");
        assert!(!recipe.is_public);
    }

    #[test]
    fn test_recipe_display() {
        let recipe = Recipe::new("Test IPA", "user1")
            .with_style("American IPA")
            .with_batch_size(20.0, "l")
            .with_ingredients(vec![RecipeIngredient::new(
                "Pale Malt",
                IngredientKind::Grain,
                5.0,
                "kg",
            )]);

        let output = format!("{}", recipe);
        assert!(output.contains("Test IPA"));
        assert!(output.contains("Style: American IPA"));
        assert!(output.contains("Batch: 20 l"));
        assert!(output.contains("5 kg Pale Malt"));
    }

    #[test]
    fn test_recipe_json_roundtrip() {
        let recipe = Recipe::new("Porter", "user1").with_boil_time(60);
        let json = serde_json::to_string(&recipe).unwrap();
        let parsed: Recipe = serde_json::from_str(&json).unwrap();
        assert_eq!(recipe, parsed);
    }
}
