use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngredientKind {
    Grain,
    Hop,
    Yeast,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecipeIngredient {
    pub name: String,
    pub kind: IngredientKind,
    pub amount: f64,
    pub unit: String,
    /// Boil or steep time in minutes, for hops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i32>,
}

impl RecipeIngredient {
    pub fn new(
        name: impl Into<String>,
        kind: IngredientKind,
        amount: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            amount,
            unit: unit.into(),
            time: None,
        }
    }

    pub fn with_time(mut self, minutes: i32) -> Self {
        self.time = Some(minutes);
        self
    }
}

impl fmt::Display for RecipeIngredient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_empty() {
            write!(f, "{} {}", self.amount, self.name)?;
        } else {
            write!(f, "{} {} {}", self.amount, self.unit, self.name)?;
        }
        if let Some(time) = self.time {
            write!(f, " @ {} min", time)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingredient_display() {
        let grain = RecipeIngredient::new("Maris Otter", IngredientKind::Grain, 4.5, "kg");
        assert_eq!(format!("{}", grain), "4.5 kg Maris Otter");
    }

    #[test]
    fn test_hop_display_with_time() {
        let hop = RecipeIngredient::new("Citra", IngredientKind::Hop, 28.0, "g").with_time(15);
        assert_eq!(format!("{}", hop), "28 g Citra @ 15 min");
    }

    #[test]
    fn test_display_no_unit() {
        let yeast = RecipeIngredient::new("US-05", IngredientKind::Yeast, 1.0, "");
        assert_eq!(format!("{}", yeast), "1 US-05");
    }
}
