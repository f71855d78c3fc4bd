//! File-backed storage: one file per key in a data directory.
//!
//! Storage layout:
//! ```text
//! <data_dir>/
//! ├── user%3A42%3Arecipes.json
//! ├── user%3A42%3Apending_operations.json
//! └── user%3A42%3Async_state.json
//! ```
//!
//! Keys are percent-encoded into file names. Writes go to a temporary file
//! that is renamed over the target, so a crash never leaves a torn value.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;

use super::{KeyValueStorage, StorageError};

/// File extension for stored values.
const VALUE_EXTENSION: &str = "json";

#[derive(Clone, Debug)]
pub struct FileStorage {
    data_dir: PathBuf,
}

impl FileStorage {
    /// Creates a new storage instance with a custom data directory.
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    /// Returns the data directory path.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the full path for a key.
    pub fn path(&self, key: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", urlencoding::encode(key), VALUE_EXTENSION))
    }

    fn io_error(path: &Path, source: io::Error) -> StorageError {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[async_trait]
impl KeyValueStorage for FileStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path(key);

        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| Self::io_error(&self.data_dir, e))?;

        let path = self.path(key);
        let tmp_path = path.with_extension("tmp");

        fs::write(&tmp_path, value)
            .await
            .map_err(|e| Self::io_error(&tmp_path, e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| Self::io_error(&path, e))?;

        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_error(&path, e)),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut entries = match fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_error(&self.data_dir, e)),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Self::io_error(&self.data_dir, e))?
        {
            let path = entry.path();

            if path.extension().and_then(|s| s.to_str()) != Some(VALUE_EXTENSION) {
                continue;
            }

            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(key) = urlencoding::decode(stem) {
                    if key.starts_with(prefix) {
                        keys.push(key.into_owned());
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_storage() -> (FileStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().to_path_buf());
        (storage, temp_dir)
    }

    #[test]
    fn test_path_encodes_key() {
        let (storage, _temp) = test_storage();
        let path = storage.path("user:42:recipes");
        assert!(path.ends_with("user%3A42%3Arecipes.json"));
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let (storage, _temp) = test_storage();
        assert!(storage.get_item("user:1:recipes").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let nested_dir = temp_dir.path().join("nested").join("data");
        let storage = FileStorage::new(nested_dir.clone());

        storage.set_item("user:1:recipes", "{}").await.unwrap();

        assert!(nested_dir.exists());
        assert!(storage.path("user:1:recipes").exists());
    }

    #[tokio::test]
    async fn test_set_and_get_roundtrip() {
        let (storage, _temp) = test_storage();

        storage.set_item("user:1:recipes", "first").await.unwrap();
        storage.set_item("user:1:recipes", "second").await.unwrap();

        assert_eq!(
            storage.get_item("user:1:recipes").await.unwrap(),
            Some("second".to_string())
        );
        assert!(!storage.path("user:1:recipes").with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_remove() {
        let (storage, _temp) = test_storage();

        storage.set_item("user:1:recipes", "x").await.unwrap();
        storage.remove_item("user:1:recipes").await.unwrap();
        assert!(storage.get_item("user:1:recipes").await.unwrap().is_none());

        // Removing again is fine
        storage.remove_item("user:1:recipes").await.unwrap();
    }

    #[tokio::test]
    async fn test_keys_with_prefix_ignores_other_files() {
        let (storage, temp_dir) = test_storage();

        storage.set_item("user:1:recipes", "a").await.unwrap();
        storage.set_item("user:1:sync_state", "b").await.unwrap();
        storage.set_item("user:2:recipes", "c").await.unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), "not a value").unwrap();

        let keys = storage.keys_with_prefix("user:1:").await.unwrap();
        assert_eq!(keys, vec!["user:1:recipes", "user:1:sync_state"]);
    }

    #[tokio::test]
    async fn test_keys_with_prefix_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path().join("absent"));
        assert!(storage.keys_with_prefix("").await.unwrap().is_empty());
    }
}
