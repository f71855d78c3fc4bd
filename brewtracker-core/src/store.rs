//! Local entity store: the on-device copy of every record the user owns.
//!
//! Records are kept in memory per entity type and written through to the
//! session's storage as one JSON map per type under `user:<id>:<type>`.
//! If a write fails the in-memory change stands, the bucket is marked dirty
//! and the write is retried on the next mutation or `flush`.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::CacheError;
use crate::events::{CacheEvent, EventBus};
use crate::models::{Entity, EntityType};
use crate::session::SessionContext;
use crate::storage::{load_json, save_json, StorageError};

type Bucket = BTreeMap<String, Entity>;

pub struct LocalEntityStore {
    session: SessionContext,
    buckets: HashMap<EntityType, Bucket>,
    dirty: BTreeSet<EntityType>,
    events: EventBus,
}

impl LocalEntityStore {
    /// Loads every bucket for the session user from storage.
    pub async fn load(session: SessionContext, events: EventBus) -> Result<Self, CacheError> {
        let mut buckets = HashMap::new();

        for entity_type in EntityType::ALL {
            let key = session.entity_key(entity_type);
            let mut bucket: Bucket = load_json(session.storage(), &key)
                .await?
                .unwrap_or_default();

            bucket.retain(|id, entity| {
                let owned = entity.user_id() == session.user_id();
                if !owned {
                    tracing::warn!(%id, owner = %entity.user_id(), "dropping foreign record from {}", key);
                }
                owned
            });

            buckets.insert(entity_type, bucket);
        }

        Ok(Self {
            session,
            buckets,
            dirty: BTreeSet::new(),
            events,
        })
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&Entity> {
        self.buckets.get(&entity_type).and_then(|b| b.get(id))
    }

    pub fn contains(&self, entity_type: EntityType, id: &str) -> bool {
        self.get(entity_type, id).is_some()
    }

    /// Lists a user's records, newest `updated_at` first, ties broken by id.
    pub fn list(&self, entity_type: EntityType, user_id: &str) -> Result<Vec<Entity>, CacheError> {
        self.session.ensure_scope(user_id)?;

        let mut entities: Vec<Entity> = self
            .buckets
            .get(&entity_type)
            .map(|b| b.values().cloned().collect())
            .unwrap_or_default();
        entities.sort_by(compare_recency);
        Ok(entities)
    }

    pub fn count(&self, entity_type: EntityType) -> usize {
        self.buckets.get(&entity_type).map_or(0, |b| b.len())
    }

    /// Inserts or replaces a whole record.
    pub async fn put(&mut self, entity: Entity) -> Result<(), CacheError> {
        self.session.ensure_scope(entity.user_id())?;

        let entity_type = entity.entity_type();
        let id = entity.id().to_string();
        self.bucket_mut(entity_type).insert(id.clone(), entity);
        self.dirty.insert(entity_type);
        self.events.emit(CacheEvent::Upserted { entity_type, id });

        self.flush().await.map_err(CacheError::from)
    }

    /// Removes a record. Returns whether it existed; a missing id is not an error.
    pub async fn remove(&mut self, entity_type: EntityType, id: &str) -> Result<bool, CacheError> {
        let existed = self.bucket_mut(entity_type).remove(id).is_some();
        if existed {
            self.dirty.insert(entity_type);
            self.events.emit(CacheEvent::Removed {
                entity_type,
                id: id.to_string(),
            });
        }

        self.flush().await?;
        Ok(existed)
    }

    /// Moves a record to the id the server assigned and rewrites every
    /// reference to the old id held by other records.
    pub async fn remap_id(
        &mut self,
        entity_type: EntityType,
        from: &str,
        to: &str,
    ) -> Result<(), CacheError> {
        if let Some(mut entity) = self.bucket_mut(entity_type).remove(from) {
            entity.set_id(to.to_string());
            self.bucket_mut(entity_type).insert(to.to_string(), entity);
            self.dirty.insert(entity_type);
            self.events.emit(CacheEvent::Remapped {
                entity_type,
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        for (bucket_type, bucket) in self.buckets.iter_mut() {
            for (id, entity) in bucket.iter_mut() {
                if entity.remap_reference(from, to) {
                    self.dirty.insert(*bucket_type);
                    self.events.emit(CacheEvent::Upserted {
                        entity_type: *bucket_type,
                        id: id.clone(),
                    });
                }
            }
        }

        self.flush().await.map_err(CacheError::from)
    }

    /// Writes every dirty bucket to storage.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        while let Some(entity_type) = self.dirty.first().copied() {
            let key = self.session.entity_key(entity_type);
            let bucket = self.buckets.get(&entity_type).cloned().unwrap_or_default();

            if let Err(e) = save_json(self.session.storage(), &key, &bucket).await {
                tracing::warn!(error = %e, "failed to persist {}; will retry", key);
                return Err(e);
            }
            self.dirty.remove(&entity_type);
        }
        Ok(())
    }

    pub fn has_unflushed_changes(&self) -> bool {
        !self.dirty.is_empty()
    }

    fn bucket_mut(&mut self, entity_type: EntityType) -> &mut Bucket {
        self.buckets.entry(entity_type).or_default()
    }
}

fn compare_recency(a: &Entity, b: &Entity) -> Ordering {
    b.updated_at()
        .cmp(&a.updated_at())
        .then_with(|| a.id().cmp(b.id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BrewSession, Recipe, Record};
    use crate::storage::MemoryStorage;
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    async fn test_store(user: &str) -> (LocalEntityStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let session = SessionContext::new(user, storage.clone());
        let store = LocalEntityStore::load(session, EventBus::new()).await.unwrap();
        (store, storage)
    }

    fn recipe(id: &str, name: &str) -> Recipe {
        let mut recipe = Recipe::new(name, "user1");
        recipe.id = id.to_string();
        recipe
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (mut store, _storage) = test_store("user1").await;
        store.put(recipe("r1", "Pale Ale").into_entity()).await.unwrap();

        let entity = store.get(EntityType::Recipe, "r1").unwrap();
        assert_eq!(entity.id(), "r1");
        assert!(store.get(EntityType::Recipe, "r2").is_none());
        assert!(store.get(EntityType::BrewSession, "r1").is_none());
    }

    #[tokio::test]
    async fn test_put_overwrites_whole_record() {
        let (mut store, _storage) = test_store("user1").await;
        let mut r = recipe("r1", "Pale Ale").with_style("APA");
        store.put(r.clone().into_entity()).await.unwrap();

        r.style = String::new();
        r.name = "Renamed".to_string();
        store.put(r.into_entity()).await.unwrap();

        let stored: Recipe = store
            .get(EntityType::Recipe, "r1")
            .cloned()
            .unwrap()
            .into_record()
            .unwrap();
        assert_eq!(stored.name, "Renamed");
        assert_eq!(stored.style, "");
    }

    #[tokio::test]
    async fn test_list_orders_by_updated_at_then_id() {
        let (mut store, _storage) = test_store("user1").await;
        let now = Utc::now();

        let mut older = recipe("a-old", "Old");
        older.updated_at = now - Duration::hours(1);
        let mut tie_b = recipe("b", "Tie B");
        tie_b.updated_at = now;
        let mut tie_a = recipe("a", "Tie A");
        tie_a.updated_at = now;

        for r in [older, tie_b, tie_a] {
            store.put(r.into_entity()).await.unwrap();
        }

        let ids: Vec<String> = store
            .list(EntityType::Recipe, "user1")
            .unwrap()
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "a-old"]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (mut store, _storage) = test_store("user1").await;
        store.put(recipe("r1", "Pale Ale").into_entity()).await.unwrap();

        assert!(store.remove(EntityType::Recipe, "r1").await.unwrap());
        assert!(!store.remove(EntityType::Recipe, "r1").await.unwrap());
        assert_eq!(store.count(EntityType::Recipe), 0);
    }

    #[tokio::test]
    async fn test_scope_violations() {
        let (mut store, _storage) = test_store("user1").await;

        let foreign = Recipe::new("Not mine", "user2");
        assert!(matches!(
            store.put(foreign.into_entity()).await,
            Err(CacheError::Scope { .. })
        ));
        assert!(matches!(
            store.list(EntityType::Recipe, "user2"),
            Err(CacheError::Scope { .. })
        ));
    }

    #[tokio::test]
    async fn test_persists_and_reloads() {
        let (mut store, storage) = test_store("user1").await;
        store.put(recipe("r1", "Pale Ale").into_entity()).await.unwrap();

        let session = SessionContext::new("user1", storage);
        let reloaded = LocalEntityStore::load(session, EventBus::new()).await.unwrap();
        assert!(reloaded.contains(EntityType::Recipe, "r1"));
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_memory_and_retries() {
        let (mut store, storage) = test_store("user1").await;

        storage.set_fail_writes(true);
        let result = store.put(recipe("r1", "Pale Ale").into_entity()).await;
        assert!(matches!(result, Err(CacheError::Storage(_))));
        assert!(store.contains(EntityType::Recipe, "r1"));
        assert!(store.has_unflushed_changes());

        storage.set_fail_writes(false);
        store.flush().await.unwrap();
        assert!(!store.has_unflushed_changes());

        let session = SessionContext::new("user1", storage);
        let reloaded = LocalEntityStore::load(session, EventBus::new()).await.unwrap();
        assert!(reloaded.contains(EntityType::Recipe, "r1"));
    }

    #[tokio::test]
    async fn test_put_emits_event() {
        let storage = Arc::new(MemoryStorage::new());
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let mut store = LocalEntityStore::load(SessionContext::new("user1", storage), events)
            .await
            .unwrap();

        store.put(recipe("r1", "Pale Ale").into_entity()).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            CacheEvent::Upserted {
                entity_type: EntityType::Recipe,
                id: "r1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_remap_id_rewrites_references() {
        let (mut store, _storage) = test_store("user1").await;
        store
            .put(recipe("local-1", "Pale Ale").into_entity())
            .await
            .unwrap();
        let mut session = BrewSession::new("Brew day", "local-1", "user1");
        session.id = "s1".to_string();
        store.put(session.into_entity()).await.unwrap();

        store
            .remap_id(EntityType::Recipe, "local-1", "srv-42")
            .await
            .unwrap();

        assert!(!store.contains(EntityType::Recipe, "local-1"));
        assert_eq!(
            store.get(EntityType::Recipe, "srv-42").unwrap().id(),
            "srv-42"
        );
        let session: BrewSession = store
            .get(EntityType::BrewSession, "s1")
            .cloned()
            .unwrap()
            .into_record()
            .unwrap();
        assert_eq!(session.recipe_id, "srv-42");
    }
}
