//! Remote API boundary: the backend the sync engine pushes to and pulls from.

mod http;
mod memory;

pub use http::HttpRemote;
pub use memory::{InMemoryRemote, RemoteCall};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::models::{Entity, EntityType, Patch};

/// Opaque marker of how much of the server's change history has been pulled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One server-side change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Change {
    Upsert {
        entity: Entity,
    },
    Delete {
        entity_type: EntityType,
        id: String,
    },
}

impl Change {
    pub fn entity_id(&self) -> &str {
        match self {
            Change::Upsert { entity } => entity.id(),
            Change::Delete { id, .. } => id,
        }
    }
}

/// A page of changes after a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
    /// Cursor to pass on the next call.
    pub cursor: Cursor,
    /// More changes are available past `cursor`.
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server unreachable (offline)")]
    Offline,

    #[error("Server returned {status}: {message}")]
    Http { status: u16, message: String },

    /// The server's version differs from the expected one.
    #[error("Version mismatch")]
    VersionMismatch { current: Option<Box<Entity>> },

    #[error("Record not found on server")]
    NotFound,

    #[error("Unauthorized; check the sync API key")]
    Unauthorized,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    /// The request could not be built from the pending operation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    /// Transient failures that are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            RemoteError::Timeout | RemoteError::Network(_) | RemoteError::Offline => true,
            RemoteError::Http { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }
}

/// CRUD plus a change feed over the backend's records.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Creates a record; the returned copy carries the server id and version.
    async fn create(&self, entity: &Entity) -> Result<Entity, RemoteError>;

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Patch,
        expected_version: u64,
    ) -> Result<Entity, RemoteError>;

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
        expected_version: Option<u64>,
    ) -> Result<(), RemoteError>;

    /// `Ok(None)` if the server has no such record.
    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>, RemoteError>;

    async fn changes_since(&self, cursor: Option<&Cursor>) -> Result<ChangeSet, RemoteError>;
}

/// Remote used when sync is not configured; every call fails as offline.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

#[async_trait]
impl RemoteApi for Offline {
    async fn create(&self, _entity: &Entity) -> Result<Entity, RemoteError> {
        Err(RemoteError::Offline)
    }

    async fn update(
        &self,
        _entity_type: EntityType,
        _id: &str,
        _patch: &Patch,
        _expected_version: u64,
    ) -> Result<Entity, RemoteError> {
        Err(RemoteError::Offline)
    }

    async fn delete(
        &self,
        _entity_type: EntityType,
        _id: &str,
        _expected_version: Option<u64>,
    ) -> Result<(), RemoteError> {
        Err(RemoteError::Offline)
    }

    async fn fetch(
        &self,
        _entity_type: EntityType,
        _id: &str,
    ) -> Result<Option<Entity>, RemoteError> {
        Err(RemoteError::Offline)
    }

    async fn changes_since(&self, _cursor: Option<&Cursor>) -> Result<ChangeSet, RemoteError> {
        Err(RemoteError::Offline)
    }
}
