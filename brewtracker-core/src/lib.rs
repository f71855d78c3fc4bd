//! BrewTracker Core Library
//!
//! Offline-first entity cache for BrewTracker: a per-user local store,
//! a durable log of pending writes, conflict detection and the sync engine
//! that reconciles all of it with the server.

pub mod cache;
pub mod conflict;
pub mod error;
pub mod events;
pub mod hooks;
pub mod models;
pub mod oplog;
pub mod remote;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;

pub use cache::{CacheConfig, CacheState, CacheStatus, SyncState, UserCache};
pub use conflict::{
    Conflict, ConflictDetector, ConflictPolicy, ConflictSet, Outcome, Resolution,
    ResolutionPlan, StoreAction,
};
pub use error::{CacheError, ValidationError};
pub use events::{CacheEvent, EventBus};
pub use hooks::{use_brew_sessions, use_fermentation_entries, use_recipes, HookState, UserData};
pub use models::{
    BrewSession, BrewSessionStatus, Entity, EntityType, FermentationEntry, IngredientKind, Patch,
    Recipe, RecipeIngredient, Record,
};
pub use oplog::{
    EnqueueOutcome, FailOutcome, OperationKind, OperationStatus, PendingOperation,
    PendingOperationLog, RetryPolicy,
};
pub use remote::{
    Change, ChangeSet, Cursor, HttpRemote, InMemoryRemote, Offline, RemoteApi, RemoteError,
};
pub use session::SessionContext;
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage, StorageError};
pub use store::LocalEntityStore;
pub use sync::{spawn_auto_sync, AutoSyncHandle, SyncEngine, SyncPhase, SyncReport};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
