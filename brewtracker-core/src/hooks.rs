//! Typed, reactive per-entity-type views over a [`UserCache`].
//!
//! `UserData<Recipe>` (from [`use_recipes`]) and friends expose the same
//! shape for every record type: the current list plus loading, error,
//! pending, conflict and last-sync state, and optimistic mutators. The state
//! is published on a `watch` channel and refreshed whenever the cache emits a
//! relevant event, so any number of observers can follow it.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, watch};
use tokio::task::JoinHandle;

use crate::cache::{SyncState, UserCache};
use crate::conflict::{Conflict, Resolution};
use crate::error::CacheError;
use crate::events::CacheEvent;
use crate::models::{diff, new_local_id, BrewSession, FermentationEntry, Patch, Recipe, Record};
use crate::sync::SyncReport;

#[derive(Debug, Clone, PartialEq)]
pub struct HookState<T> {
    pub data: Vec<T>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub pending_count: usize,
    pub conflict_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
}

impl<T> Default for HookState<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            is_loading: true,
            error: None,
            pending_count: 0,
            conflict_count: 0,
            last_sync: None,
        }
    }
}

pub struct UserData<T: Record> {
    cache: Arc<UserCache>,
    state: Arc<watch::Sender<HookState<T>>>,
    listener: JoinHandle<()>,
}

pub async fn use_recipes(cache: Arc<UserCache>) -> UserData<Recipe> {
    UserData::new(cache).await
}

pub async fn use_brew_sessions(cache: Arc<UserCache>) -> UserData<BrewSession> {
    UserData::new(cache).await
}

pub async fn use_fermentation_entries(cache: Arc<UserCache>) -> UserData<FermentationEntry> {
    UserData::new(cache).await
}

impl<T: Record> UserData<T> {
    /// Loads the current state and starts following cache events.
    pub async fn new(cache: Arc<UserCache>) -> Self {
        let (sender, _) = watch::channel(HookState::default());
        let state = Arc::new(sender);

        let mut events = cache.subscribe();
        reload(&cache, &state).await;

        let listener = {
            let cache = cache.clone();
            let state = state.clone();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(CacheEvent::SyncStarted) => {
                            state.send_modify(|s| s.is_loading = true);
                        }
                        Ok(event) if affects::<T>(&event) => reload(&cache, &state).await,
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(skipped, "hook listener lagged; reloading");
                            reload(&cache, &state).await;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            cache,
            state,
            listener,
        }
    }

    /// The latest published state.
    pub fn state(&self) -> HookState<T> {
        self.state.borrow().clone()
    }

    /// Follows state changes.
    pub fn subscribe(&self) -> watch::Receiver<HookState<T>> {
        self.state.subscribe()
    }

    pub fn data(&self) -> Vec<T> {
        self.state.borrow().data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn pending_count(&self) -> usize {
        self.state.borrow().pending_count
    }

    pub fn conflict_count(&self) -> usize {
        self.state.borrow().conflict_count
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.borrow().last_sync
    }

    pub async fn get_by_id(&self, id: &str) -> Option<T> {
        self.cache
            .get(T::ENTITY_TYPE, id)
            .await
            .and_then(|e| e.into_record())
    }

    /// Stores `record` under a new local id and queues it for the server.
    /// An empty `user_id` is filled in with the session user.
    pub async fn create(&self, mut record: T) -> Result<T, CacheError> {
        if record.user_id().is_empty() {
            record.set_user_id(self.cache.user_id().to_string());
        }
        let created = self.cache.create(record.into_entity()).await?;
        self.settle().await;
        into_typed(created)
    }

    pub async fn update(&self, id: &str, patch: Patch) -> Result<T, CacheError> {
        let updated = self.cache.update(T::ENTITY_TYPE, id, patch).await?;
        self.settle().await;
        into_typed(updated)
    }

    /// Edits a copy of the record in place and sends the difference.
    pub async fn update_with(&self, id: &str, edit: impl FnOnce(&mut T)) -> Result<T, CacheError> {
        let current = self
            .get_by_id(id)
            .await
            .ok_or_else(|| CacheError::not_found(T::ENTITY_TYPE, id))?;
        let mut edited = current.clone();
        edit(&mut edited);

        let patch = diff(&current, &edited)?;
        if patch.is_empty() {
            return Ok(current);
        }
        self.update(id, patch).await
    }

    /// Returns false if there was nothing to delete.
    pub async fn delete(&self, id: &str) -> Result<bool, CacheError> {
        let deleted = self.cache.delete(T::ENTITY_TYPE, id).await?;
        self.settle().await;
        Ok(deleted)
    }

    /// Creates a copy of an existing record as a new, unsynced record.
    pub async fn clone_entity(&self, id: &str) -> Result<T, CacheError> {
        let mut copy = self
            .get_by_id(id)
            .await
            .ok_or_else(|| CacheError::not_found(T::ENTITY_TYPE, id))?;
        let now = Utc::now();
        copy.set_id(new_local_id());
        copy.set_version(0);
        copy.set_timestamps(now, now);
        copy.prepare_copy();
        self.create(copy).await
    }

    pub async fn sync_state(&self, id: &str) -> SyncState {
        self.cache.sync_state(id).await
    }

    pub async fn sync(&self) -> SyncReport {
        self.state.send_modify(|s| s.is_loading = true);
        let report = self.cache.sync().await;
        self.settle().await;
        report
    }

    /// Pulls server changes without sending pending operations.
    pub async fn refresh(&self) -> SyncReport {
        self.state.send_modify(|s| s.is_loading = true);
        let report = self.cache.refresh().await;
        self.settle().await;
        report
    }

    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.cache
            .conflicts()
            .await
            .into_iter()
            .filter(|c| c.entity_type == T::ENTITY_TYPE)
            .collect()
    }

    pub async fn resolve_conflict(&self, id: &str, resolution: Resolution) -> Result<(), CacheError> {
        self.cache
            .resolve_conflict(T::ENTITY_TYPE, id, resolution)
            .await?;
        self.settle().await;
        Ok(())
    }

    /// Publishes fresh state right away instead of waiting for the listener.
    async fn settle(&self) {
        reload(&self.cache, &self.state).await;
    }
}

impl<T: Record> Drop for UserData<T> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn into_typed<T: Record>(entity: crate::models::Entity) -> Result<T, CacheError> {
    let entity_type = entity.entity_type();
    let id = entity.id().to_string();
    entity
        .into_record()
        .ok_or_else(|| CacheError::not_found(entity_type, id))
}

fn affects<T: Record>(event: &CacheEvent) -> bool {
    match event.entity_type() {
        Some(entity_type) => entity_type == T::ENTITY_TYPE,
        None => !matches!(event, CacheEvent::SyncStarted),
    }
}

async fn reload<T: Record>(cache: &UserCache, state: &watch::Sender<HookState<T>>) {
    let error = cache.last_error();
    let is_loading = cache.engine().phase() != crate::sync::SyncPhase::Idle;

    let next = cache
        .with_state(|cache_state| {
            let data = cache_state
                .store()
                .list(T::ENTITY_TYPE, cache.user_id())
                .map(|entities| {
                    entities
                        .into_iter()
                        .filter_map(|e| e.into_record::<T>())
                        .collect::<Vec<T>>()
                });
            let (data, error) = match data {
                Ok(data) => (data, error),
                Err(e) => (Vec::new(), Some(e.to_string())),
            };
            HookState {
                data,
                is_loading,
                error,
                pending_count: cache_state.log().count_for(T::ENTITY_TYPE),
                conflict_count: cache_state.conflicts().count_for(T::ENTITY_TYPE),
                last_sync: cache_state.meta().last_sync,
            }
        })
        .await;

    state.send_replace(next);
}
