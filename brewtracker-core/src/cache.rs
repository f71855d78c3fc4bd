//! The per-user cache: store, pending log and conflicts behind one lock,
//! plus the sync engine that reconciles them with the server.
//!
//! [`UserCache`] is the write path for local mutations. Every mutation is
//! applied to the store first (optimistic), then queued for the server.
//! Validation and scope errors are returned to the caller before anything is
//! touched; storage failures are logged, recorded in [`UserCache::last_error`]
//! and otherwise absorbed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};

use crate::conflict::{Conflict, ConflictPolicy, ConflictSet, Resolution, StoreAction};
use crate::error::CacheError;
use crate::events::{CacheEvent, EventBus};
use crate::models::{check_patch, is_local_id, new_local_id, Entity, EntityType, Patch};
use crate::oplog::{
    EnqueueOutcome, OperationKind, PendingOperation, PendingOperationLog, RetryPolicy,
};
use crate::remote::{Cursor, RemoteApi};
use crate::session::SessionContext;
use crate::storage::StorageError;
use crate::store::LocalEntityStore;
use crate::sync::{spawn_auto_sync, AutoSyncHandle, SyncEngine, SyncMeta, SyncReport};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub retry: RetryPolicy,
    /// Bound on every remote call.
    pub request_timeout: Duration,
    /// Applied by [`UserCache::resolve_all`] only.
    pub conflict_policy: ConflictPolicy,
    /// Periodic sync while online; `None` syncs only on reconnect.
    pub auto_sync_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            conflict_policy: ConflictPolicy::Manual,
            auto_sync_interval: None,
        }
    }
}

/// Derived synchronization state of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    Pending,
    Conflict,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SyncState::Synced => "synced",
            SyncState::Pending => "pending",
            SyncState::Conflict => "conflict",
        };
        write!(f, "{}", s)
    }
}

/// Counters shown by status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStatus {
    pub pending: usize,
    pub failed: usize,
    pub conflicts: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub cursor: Option<Cursor>,
}

/// Everything the cache mutates, guarded together.
pub struct CacheState {
    pub(crate) store: LocalEntityStore,
    pub(crate) log: PendingOperationLog,
    pub(crate) conflicts: ConflictSet,
    pub(crate) meta: SyncMeta,
}

impl CacheState {
    pub async fn load(
        session: SessionContext,
        events: EventBus,
        retry: RetryPolicy,
    ) -> Result<Self, CacheError> {
        let log = PendingOperationLog::load(&session, retry).await?;
        let conflicts = ConflictSet::load(&session).await?;
        let meta = SyncMeta::load(&session).await?;
        let store = LocalEntityStore::load(session, events).await?;
        Ok(Self {
            store,
            log,
            conflicts,
            meta,
        })
    }

    pub fn store(&self) -> &LocalEntityStore {
        &self.store
    }

    pub fn log(&self) -> &PendingOperationLog {
        &self.log
    }

    pub fn conflicts(&self) -> &ConflictSet {
        &self.conflicts
    }

    pub fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    pub fn pending_count(&self) -> usize {
        self.log.count()
    }

    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    pub fn sync_state(&self, entity_id: &str) -> SyncState {
        if self.conflicts.contains(entity_id) {
            SyncState::Conflict
        } else if self.log.has_pending(entity_id) {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }

    /// Writes the log, the conflicts and any dirty store buckets.
    pub(crate) async fn persist(&mut self) -> Result<(), StorageError> {
        let session = self.store.session().clone();
        let log = self.log.flush(&session).await;
        let conflicts = self.conflicts.flush(&session).await;
        let store = self.store.flush().await;
        log.and(conflicts).and(store)
    }

    pub(crate) fn publish_counts(&self, events: &EventBus) {
        events.emit(CacheEvent::PendingChanged {
            count: self.log.count(),
        });
        events.emit(CacheEvent::ConflictsChanged {
            count: self.conflicts.len(),
        });
    }
}

/// The latest absorbed failure, shared with the background sync task.
#[derive(Debug, Clone)]
struct ErrorSlot {
    message: Arc<StdMutex<Option<String>>>,
    events: EventBus,
}

impl ErrorSlot {
    fn new(events: EventBus) -> Self {
        Self {
            message: Arc::new(StdMutex::new(None)),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.message
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn get(&self) -> Option<String> {
        self.lock().clone()
    }

    fn set(&self, message: String) {
        *self.lock() = Some(message.clone());
        self.events.emit(CacheEvent::StorageFailed { message });
    }

    /// Returns true if there was an error to clear.
    fn clear(&self) -> bool {
        let cleared = self.lock().take().is_some();
        if cleared {
            self.events.emit(CacheEvent::ErrorCleared);
        }
        cleared
    }

    fn record(&self, report: &SyncReport) {
        let error = report
            .pull_error
            .as_ref()
            .map(|e| e.to_string())
            .or_else(|| report.storage_error.clone());
        match error {
            Some(message) => self.set(message),
            None => {
                if self.clear() {
                    tracing::info!("sync recovered");
                }
            }
        }
    }
}

pub struct UserCache {
    session: SessionContext,
    state: Arc<Mutex<CacheState>>,
    events: EventBus,
    engine: Arc<SyncEngine>,
    config: CacheConfig,
    errors: ErrorSlot,
}

impl UserCache {
    /// Loads the user's cache from storage.
    pub async fn open(
        session: SessionContext,
        remote: Arc<dyn RemoteApi>,
        config: CacheConfig,
    ) -> Result<Self, CacheError> {
        let events = EventBus::new();
        let state = CacheState::load(session.clone(), events.clone(), config.retry.clone()).await?;
        tracing::debug!(
            user_id = %session.user_id(),
            pending = state.pending_count(),
            conflicts = state.conflict_count(),
            "cache opened"
        );

        let state = Arc::new(Mutex::new(state));
        let engine = Arc::new(SyncEngine::new(
            state.clone(),
            remote,
            events.clone(),
            config.request_timeout,
        ));

        Ok(Self {
            session,
            state,
            engine,
            config,
            errors: ErrorSlot::new(events.clone()),
            events,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn user_id(&self) -> &str {
        self.session.user_id()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Runs `f` with shared access to the cache state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&CacheState) -> R) -> R {
        let state = self.state.lock().await;
        f(&state)
    }

    /// The most recent absorbed storage or sync failure, if not yet cleared
    /// by a later success.
    pub fn last_error(&self) -> Option<String> {
        self.errors.get()
    }

    /// Passes caller errors through; logs and records anything else.
    fn absorb(&self, result: Result<(), CacheError>) -> Result<(), CacheError> {
        match result {
            Err(e) if e.is_caller_error() => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "local write not persisted; will retry");
                self.errors.set(e.to_string());
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    /// Persists everything and publishes the counters.
    async fn commit(&self, state: &mut CacheState) {
        match state.persist().await {
            Ok(()) => {
                if self.errors.clear() {
                    tracing::info!("storage writes recovered");
                }
            }
            Err(e) => {
                let _ = self.absorb(Err(e.into()));
            }
        }
        state.publish_counts(&self.events);
    }

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
        self.state.lock().await.store.get(entity_type, id).cloned()
    }

    pub async fn list(&self, entity_type: EntityType) -> Result<Vec<Entity>, CacheError> {
        self.state
            .lock()
            .await
            .store
            .list(entity_type, self.session.user_id())
    }

    /// Stores a new record under a fresh local id and queues its create.
    pub async fn create(&self, mut entity: Entity) -> Result<Entity, CacheError> {
        self.session.ensure_scope(entity.user_id())?;
        entity.validate()?;

        let mut state = self.state.lock().await;
        if !is_local_id(entity.id()) || state.store.contains(entity.entity_type(), entity.id()) {
            entity.set_id(new_local_id());
        }
        entity.set_version(0);
        entity.touch();
        let op = PendingOperation::create(&entity)?;

        self.absorb(state.store.put(entity.clone()).await)?;
        state.log.enqueue(op);
        self.commit(&mut state).await;
        Ok(entity)
    }

    /// Applies `patch` locally and queues it for the server.
    pub async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: Patch,
    ) -> Result<Entity, CacheError> {
        check_patch(&patch)?;

        let mut state = self.state.lock().await;
        let current = state
            .store
            .get(entity_type, id)
            .cloned()
            .ok_or_else(|| CacheError::not_found(entity_type, id))?;
        let mut updated = current.apply_patch(&patch)?;
        updated.validate()?;
        updated.touch();

        if state.conflicts.contains(id) {
            // Held with the conflict until it is resolved.
            state.conflicts.amend_local(updated.clone(), &patch);
        } else {
            let op = PendingOperation::update(&current, patch)?;
            state.log.enqueue(op);
        }
        self.absorb(state.store.put(updated.clone()).await)?;
        self.commit(&mut state).await;
        Ok(updated)
    }

    /// Removes a record locally and queues the delete. Returns false if the
    /// record did not exist.
    pub async fn delete(&self, entity_type: EntityType, id: &str) -> Result<bool, CacheError> {
        let mut state = self.state.lock().await;
        let Some(current) = state.store.get(entity_type, id).cloned() else {
            return Ok(false);
        };

        let op = match state.conflicts.remove(id) {
            Some(conflict) => conflict.server_snapshot.as_ref().map(PendingOperation::delete),
            None => Some(PendingOperation::delete(&current)),
        };
        if let Some(op) = op {
            if let EnqueueOutcome::Cancelled { removed } = state.log.enqueue(op) {
                tracing::debug!(%id, removed, "deleted a record the server never saw");
            }
        }

        self.absorb(state.store.remove(entity_type, id).await.map(|_| ()))?;
        self.commit(&mut state).await;
        Ok(true)
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending_count()
    }

    pub async fn conflict_count(&self) -> usize {
        self.state.lock().await.conflict_count()
    }

    pub async fn sync_state(&self, entity_id: &str) -> SyncState {
        self.state.lock().await.sync_state(entity_id)
    }

    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.meta.last_sync
    }

    pub async fn status(&self) -> CacheStatus {
        let state = self.state.lock().await;
        CacheStatus {
            pending: state.log.count(),
            failed: state.log.failed_operations().len(),
            conflicts: state.conflicts.len(),
            last_sync: state.meta.last_sync,
            cursor: state.meta.cursor.clone(),
        }
    }

    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.state.lock().await.conflicts.list()
    }

    pub async fn failed_operations(&self) -> Vec<PendingOperation> {
        self.state.lock().await.log.failed_operations()
    }

    /// Re-arms a parked operation. Returns false if no such parked operation exists.
    pub async fn retry_failed(&self, op_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let retried = state.log.retry_failed(op_id);
        if retried {
            self.commit(&mut state).await;
        }
        retried
    }

    /// Gives up on a parked operation. A discarded create also removes the
    /// record it would have created.
    pub async fn discard_failed(&self, op_id: &str) -> Option<PendingOperation> {
        let mut state = self.state.lock().await;
        let op = state.log.discard(op_id)?;
        if op.kind == OperationKind::Create && !state.log.has_pending(&op.entity_id) {
            let removed = state.store.remove(op.entity_type, &op.entity_id).await;
            let _ = self.absorb(removed.map(|_| ()));
        }
        self.commit(&mut state).await;
        Some(op)
    }

    /// Settles one conflict.
    pub async fn resolve_conflict(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        resolution: Resolution,
    ) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        let conflict = state
            .conflicts
            .get(entity_id)
            .filter(|c| c.entity_type == entity_type)
            .cloned()
            .ok_or_else(|| CacheError::not_found(entity_type, entity_id))?;
        let plan = conflict.plan(&resolution)?;

        tracing::info!(%entity_type, %entity_id, ?resolution, "resolving conflict");
        state.conflicts.remove(entity_id);
        let stored = match plan.store {
            StoreAction::Put(entity) => state.store.put(entity).await,
            StoreAction::Remove => state.store.remove(entity_type, entity_id).await.map(|_| ()),
        };
        if let Some(op) = plan.operation {
            state.log.enqueue(op);
        }
        self.absorb(stored)?;
        self.commit(&mut state).await;
        Ok(())
    }

    /// Applies the configured conflict policy to every open conflict.
    /// Returns how many were resolved; `Manual` resolves none.
    pub async fn resolve_all(&self) -> Result<usize, CacheError> {
        let Some(resolution) = self.config.conflict_policy.resolution() else {
            return Ok(0);
        };

        let mut resolved = 0;
        for conflict in self.conflicts().await {
            match self
                .resolve_conflict(conflict.entity_type, &conflict.entity_id, resolution.clone())
                .await
            {
                Ok(()) => resolved += 1,
                Err(CacheError::Validation(e)) => {
                    tracing::warn!(entity_id = %conflict.entity_id, error = %e, "cannot auto-resolve conflict")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    /// Runs a full sync cycle; see [`SyncEngine::sync`].
    pub async fn sync(&self) -> SyncReport {
        let report = self.engine.sync().await;
        self.errors.record(&report);
        report
    }

    /// Pulls server changes without sending pending operations.
    pub async fn refresh(&self) -> SyncReport {
        let report = self.engine.refresh().await;
        self.errors.record(&report);
        report
    }

    /// Writes all in-memory state to storage.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        state.persist().await?;
        Ok(())
    }

    /// Starts background sync on reconnect and on the configured interval.
    /// Its failures and recoveries land in [`UserCache::last_error`].
    pub fn spawn_auto_sync(&self, connectivity: watch::Receiver<bool>) -> AutoSyncHandle {
        let errors = self.errors.clone();
        spawn_auto_sync(
            self.engine.clone(),
            connectivity,
            self.config.auto_sync_interval,
            move |report| errors.record(report),
        )
    }
}
