use async_trait::async_trait;
use brewtracker_core::{KeyValueStorage, StorageError};
use chrono::Utc;
use sqlx::SqlitePool;

/// Key-value storage in the `kv_items` table.
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        sqlx::query_scalar::<_, String>("SELECT value FROM kv_items WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO kv_items (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_items WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        // Not LIKE: '_' in user ids must match literally.
        sqlx::query_scalar::<_, String>(
            "SELECT key FROM kv_items WHERE instr(key, ?) = 1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)
    }
}
