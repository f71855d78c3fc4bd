mod brew_session;
mod entity;
mod entity_type;
mod fermentation_entry;
mod ingredient;
mod recipe;
mod record;

pub use brew_session::{BrewSession, BrewSessionStatus};
pub use entity::Entity;
pub use entity_type::EntityType;
pub use fermentation_entry::FermentationEntry;
pub use ingredient::{IngredientKind, RecipeIngredient};
pub use recipe::Recipe;
pub use record::{
    apply_patch, check_patch, diff, record_fields, select_fields, Patch, Record, PROTECTED_FIELDS,
};

use uuid::Uuid;

/// Prefix for ids assigned on this device before the server confirms a create.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Generates a client-side id for a record created offline.
pub fn new_local_id() -> String {
    format!("{}{}", LOCAL_ID_PREFIX, Uuid::new_v4())
}

/// True if the id was assigned locally and has not been replaced by a server id.
pub fn is_local_id(id: &str) -> bool {
    id.starts_with(LOCAL_ID_PREFIX)
}
