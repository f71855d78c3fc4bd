//! Synchronization between the local cache and the remote API.

mod auto_sync;
mod engine;

pub use auto_sync::{spawn_auto_sync, AutoSyncHandle};
pub use engine::{SyncEngine, SyncPhase, SyncReport};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::Cursor;
use crate::session::SessionContext;
use crate::storage::{load_json, save_json, StorageError};

const SYNC_STATE_KEY: &str = "sync_state";

/// Pull position and time of the last successful pull, persisted under
/// `user:<id>:sync_state`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub cursor: Option<Cursor>,
    pub last_sync: Option<DateTime<Utc>>,
}

impl SyncMeta {
    pub async fn load(session: &SessionContext) -> Result<Self, StorageError> {
        Ok(load_json(session.storage(), &session.key(SYNC_STATE_KEY))
            .await?
            .unwrap_or_default())
    }

    pub async fn save(&self, session: &SessionContext) -> Result<(), StorageError> {
        save_json(session.storage(), &session.key(SYNC_STATE_KEY), self).await
    }
}
