//! Persistent key-value storage boundary.
//!
//! The cache persists everything through [`KeyValueStorage`], an async
//! `getItem/setItem/removeItem` style interface. Keys are namespaced per user
//! (see [`crate::session::SessionContext::key`]), e.g. `user:42:recipes`.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Async key-value storage holding string values.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    /// Returns `Ok(None)` if the key is absent.
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Removing a missing key is not an error.
    async fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Corrupt value under '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Loads and deserializes a JSON value.
pub async fn load_json<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match storage.get_item(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Serializes and stores a JSON value.
pub async fn save_json<T: Serialize + ?Sized>(
    storage: &dyn KeyValueStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|e| StorageError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    storage.set_item(key, &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_json_roundtrip() {
        let storage = MemoryStorage::new();
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u64);

        save_json(&storage, "user:1:test", &value).await.unwrap();
        let loaded: Option<BTreeMap<String, u64>> =
            load_json(&storage, "user:1:test").await.unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[tokio::test]
    async fn test_load_json_missing() {
        let storage = MemoryStorage::new();
        let loaded: Option<Vec<String>> = load_json(&storage, "missing").await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_load_json_corrupt() {
        let storage = MemoryStorage::new();
        storage.set_item("user:1:bad", "{not json").await.unwrap();
        let result: Result<Option<Vec<String>>, _> = load_json(&storage, "user:1:bad").await;
        assert!(matches!(result, Err(StorageError::Corrupt { .. })));
    }
}
