//! The `Record` trait and field-level patch helpers.
//!
//! Updates travel through the cache as patches: a JSON object mapping
//! top-level field names to their new values. Bookkeeping fields owned by the
//! cache (`id`, `user_id`, `version` and the timestamps) can never be patched.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

use super::{Entity, EntityType};
use crate::error::ValidationError;

/// Field name to new value.
pub type Patch = serde_json::Map<String, Value>;

/// Fields maintained by the cache and the server, never by a patch.
pub const PROTECTED_FIELDS: [&str; 5] = ["id", "user_id", "version", "created_at", "updated_at"];

/// A domain record that can live in the local entity store.
pub trait Record:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const ENTITY_TYPE: EntityType;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn user_id(&self) -> &str;
    fn set_user_id(&mut self, user_id: String);
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn created_at(&self) -> DateTime<Utc>;
    fn updated_at(&self) -> DateTime<Utc>;
    fn set_timestamps(&mut self, created_at: DateTime<Utc>, updated_at: DateTime<Utc>);

    /// Checks required fields and value ranges.
    fn validate(&self) -> Result<(), ValidationError>;

    /// Rewrites a reference to another record's id. Returns true if anything changed.
    fn remap_reference(&mut self, _from: &str, _to: &str) -> bool {
        false
    }

    /// Adjusts a duplicated record before it is stored under a new id.
    fn prepare_copy(&mut self) {}

    fn into_entity(self) -> Entity;
    fn from_entity(entity: Entity) -> Option<Self>;
}

/// Rejects empty patches and patches touching protected fields.
pub fn check_patch(patch: &Patch) -> Result<(), ValidationError> {
    if patch.is_empty() {
        return Err(ValidationError::InvalidPatch("patch is empty".to_string()));
    }
    if let Some(field) = patch
        .keys()
        .find(|k| PROTECTED_FIELDS.contains(&k.as_str()))
    {
        return Err(ValidationError::InvalidPatch(format!(
            "field '{}' cannot be changed",
            field
        )));
    }
    Ok(())
}

/// Returns a copy of `record` with `patch` applied.
pub fn apply_patch<T: Record>(record: &T, patch: &Patch) -> Result<T, ValidationError> {
    check_patch(patch)?;

    let mut value =
        serde_json::to_value(record).map_err(|e| ValidationError::InvalidPatch(e.to_string()))?;
    let fields = value
        .as_object_mut()
        .ok_or_else(|| ValidationError::InvalidPatch("record is not an object".to_string()))?;

    for (key, new_value) in patch {
        if !fields.contains_key(key) {
            return Err(ValidationError::InvalidPatch(format!(
                "unknown field '{}'",
                key
            )));
        }
        fields.insert(key.clone(), new_value.clone());
    }

    serde_json::from_value(value).map_err(|e| ValidationError::InvalidPatch(e.to_string()))
}

/// Computes the patch that turns `before` into `after`, ignoring protected fields.
pub fn diff<T: Record>(before: &T, after: &T) -> Result<Patch, serde_json::Error> {
    let before = record_fields(before)?;
    let after = record_fields(after)?;

    Ok(after
        .into_iter()
        .filter(|(key, _)| !PROTECTED_FIELDS.contains(&key.as_str()))
        .filter(|(key, value)| before.get(key) != Some(value))
        .collect())
}

/// Serializes a record into its field map.
pub fn record_fields<T: Serialize>(record: &T) -> Result<Patch, serde_json::Error> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        _ => Ok(Patch::new()),
    }
}

/// Picks the values of `keys` out of a field map; missing keys map to `null`.
pub fn select_fields<'a>(fields: &Patch, keys: impl IntoIterator<Item = &'a String>) -> Patch {
    keys.into_iter()
        .map(|k| (k.clone(), fields.get(k).cloned().unwrap_or(Value::Null)))
        .collect()
}
