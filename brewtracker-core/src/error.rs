//! Error types shared across the cache.

use thiserror::Error;

use crate::models::EntityType;
use crate::remote::RemoteError;
use crate::storage::StorageError;

/// A record failed validation before it reached the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} is required")]
    Required { field: &'static str },

    #[error("{field} is out of range: {message}")]
    OutOfRange {
        field: &'static str,
        message: String,
    },

    #[error("Invalid patch: {0}")]
    InvalidPatch(String),
}

impl ValidationError {
    pub(crate) fn out_of_range(field: &'static str, message: impl Into<String>) -> Self {
        ValidationError::OutOfRange {
            field,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the cache, its store and its hooks.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Persistent storage read or write failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Data belonging to another user was requested.
    #[error("Scope violation: session for '{session}' cannot access data of '{requested}'")]
    Scope { session: String, requested: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{entity_type} not found: {id}")]
    NotFound { entity_type: EntityType, id: String },

    /// Remote call failed (only surfaced by explicit sync calls).
    #[error("Network error: {0}")]
    Network(#[from] RemoteError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn not_found(entity_type: EntityType, id: impl Into<String>) -> Self {
        CacheError::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// True for errors a mutator must return to its caller rather than absorb.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            CacheError::Scope { .. } | CacheError::Validation(_) | CacheError::NotFound { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::Required { field: "name" };
        assert_eq!(err.to_string(), "name is required");

        let err = ValidationError::out_of_range("efficiency", "must be between 0 and 100");
        assert_eq!(
            err.to_string(),
            "efficiency is out of range: must be between 0 and 100"
        );
    }

    #[test]
    fn test_caller_errors() {
        assert!(CacheError::from(ValidationError::Required { field: "name" }).is_caller_error());
        assert!(CacheError::Scope {
            session: "a".into(),
            requested: "b".into()
        }
        .is_caller_error());
        assert!(CacheError::not_found(EntityType::Recipe, "r1").is_caller_error());
        assert!(!CacheError::from(StorageError::Unavailable("disk full".into())).is_caller_error());
    }

    #[test]
    fn test_not_found_display() {
        let err = CacheError::not_found(EntityType::BrewSession, "local-1");
        assert_eq!(err.to_string(), "brew_sessions not found: local-1");
    }
}
