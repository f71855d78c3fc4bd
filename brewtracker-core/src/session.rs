//! Per-user session context threaded through every cache component.

use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;
use crate::models::EntityType;
use crate::storage::KeyValueStorage;

/// The authenticated user plus the storage their cache lives in.
///
/// Every storage key the cache touches is namespaced as `user:<id>:<suffix>`,
/// so sessions for different users can share one storage backend.
#[derive(Clone)]
pub struct SessionContext {
    user_id: String,
    storage: Arc<dyn KeyValueStorage>,
}

impl SessionContext {
    pub fn new(user_id: impl Into<String>, storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            user_id: user_id.into(),
            storage,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn storage(&self) -> &dyn KeyValueStorage {
        self.storage.as_ref()
    }

    /// Returns the namespaced storage key for `suffix`.
    pub fn key(&self, suffix: &str) -> String {
        format!("user:{}:{}", self.user_id, suffix)
    }

    pub fn entity_key(&self, entity_type: EntityType) -> String {
        self.key(entity_type.as_str())
    }

    /// Fails with `CacheError::Scope` if `user_id` is not the session user.
    pub fn ensure_scope(&self, user_id: &str) -> Result<(), CacheError> {
        if user_id == self.user_id {
            return Ok(());
        }
        tracing::error!(
            session = %self.user_id,
            requested = %user_id,
            "cross-user data access rejected"
        );
        Err(CacheError::Scope {
            session: self.user_id.clone(),
            requested: user_id.to_string(),
        })
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}
