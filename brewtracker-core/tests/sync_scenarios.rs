//! End-to-end behavior of the cache against the in-process backend.

use brewtracker_core::remote::RemoteCall;
use brewtracker_core::{
    use_brew_sessions, BrewSession, CacheConfig, CacheError, EntityType, InMemoryRemote,
    KeyValueStorage, MemoryStorage, Recipe, Record, Resolution, SessionContext, SyncState,
    UserCache,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn open(storage: &Arc<MemoryStorage>, remote: &Arc<InMemoryRemote>) -> Arc<UserCache> {
    let session = SessionContext::new("user1", storage.clone());
    Arc::new(
        UserCache::open(session, remote.clone(), CacheConfig::default())
            .await
            .unwrap(),
    )
}

async fn device(remote: &Arc<InMemoryRemote>) -> Arc<UserCache> {
    open(&Arc::new(MemoryStorage::new()), remote).await
}

fn patch(value: serde_json::Value) -> brewtracker_core::Patch {
    value.as_object().cloned().unwrap()
}

fn count_calls(remote: &InMemoryRemote, pred: impl Fn(&RemoteCall) -> bool) -> usize {
    remote.calls().iter().filter(|c| pred(c)).count()
}

#[tokio::test]
async fn test_offline_brew_session_adopts_server_id() {
    let remote = Arc::new(InMemoryRemote::new().with_next_id(41));
    let cache = device(&remote).await;
    let sessions = use_brew_sessions(cache.clone()).await;

    remote.set_online(false);
    let created = sessions
        .create(BrewSession::new("IPA Brew", "srv-7", ""))
        .await
        .unwrap();
    assert!(created.id.starts_with("local-"));
    assert_eq!(sessions.pending_count(), 1);
    assert_eq!(sessions.data().len(), 1);
    assert_eq!(sessions.sync_state(&created.id).await, SyncState::Pending);

    let report = sessions.sync().await;
    assert_eq!(report.retried, 1);
    assert_eq!(sessions.pending_count(), 1);
    assert!(sessions.error().is_some());

    remote.set_online(true);
    let report = sessions.sync().await;
    assert_eq!(report.pushed, 1);

    let data = sessions.data();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].id, "srv-42");
    assert_eq!(data[0].name, "IPA Brew");
    assert_eq!(sessions.pending_count(), 0);
    assert!(sessions.error().is_none());
    assert_eq!(sessions.sync_state("srv-42").await, SyncState::Synced);
    assert!(sessions.get_by_id(&created.id).await.is_none());
}

#[tokio::test]
async fn test_mutations_are_visible_before_sync() {
    let remote = Arc::new(InMemoryRemote::new());
    remote.set_online(false);
    let cache = device(&remote).await;

    let recipe = cache
        .create(Recipe::new("Pale Ale", "user1").into_entity())
        .await
        .unwrap();
    let id = recipe.id().to_string();
    assert_eq!(cache.get(EntityType::Recipe, &id).await, Some(recipe));

    cache
        .update(EntityType::Recipe, &id, patch(json!({"style": "APA"})))
        .await
        .unwrap();
    let stored: Recipe = cache
        .get(EntityType::Recipe, &id)
        .await
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(stored.style, "APA");
    assert_eq!(cache.sync_state(&id).await, SyncState::Pending);

    // The server never saw it, so nothing is left to send.
    assert!(cache.delete(EntityType::Recipe, &id).await.unwrap());
    assert!(cache.get(EntityType::Recipe, &id).await.is_none());
    assert_eq!(cache.pending_count().await, 0);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn test_queued_edits_coalesce_into_one_call() {
    let remote = Arc::new(InMemoryRemote::new());
    let cache = device(&remote).await;

    remote.set_online(false);
    let recipe = cache
        .create(Recipe::new("Stout", "user1").into_entity())
        .await
        .unwrap();
    for name in ["Dry Stout", "Oatmeal Stout", "Milk Stout"] {
        cache
            .update(EntityType::Recipe, recipe.id(), patch(json!({"name": name})))
            .await
            .unwrap();
    }
    assert_eq!(cache.pending_count().await, 1);

    remote.set_online(true);
    remote.clear_calls();
    let report = cache.sync().await;
    assert_eq!(report.pushed, 1);
    assert_eq!(
        count_calls(&remote, |c| matches!(c, RemoteCall::Create { .. })),
        1
    );
    assert_eq!(
        count_calls(&remote, |c| matches!(c, RemoteCall::Update { .. })),
        0
    );

    let server: Recipe = remote
        .get(EntityType::Recipe, "srv-1")
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(server.name, "Milk Stout");

    // Edits to a synced record fold into a single update as well.
    for efficiency in [70.0, 72.0, 74.0] {
        cache
            .update(
                EntityType::Recipe,
                "srv-1",
                patch(json!({"efficiency": efficiency})),
            )
            .await
            .unwrap();
    }
    remote.clear_calls();
    cache.sync().await;
    assert_eq!(
        count_calls(&remote, |c| matches!(c, RemoteCall::Update { .. })),
        1
    );
    assert_eq!(remote.get(EntityType::Recipe, "srv-1").unwrap().version(), 2);
}

#[tokio::test]
async fn test_operations_on_one_entity_are_sent_in_order() {
    let remote = Arc::new(InMemoryRemote::new());
    let cache = device(&remote).await;
    cache
        .create(Recipe::new("Lager", "user1").into_entity())
        .await
        .unwrap();
    cache.sync().await;

    remote.set_delay(Some(Duration::from_millis(50)));
    remote.clear_calls();
    cache
        .update(EntityType::Recipe, "srv-1", patch(json!({"name": "Helles"})))
        .await
        .unwrap();

    let background = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.sync().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The first update is on the wire; this one queues behind it.
    cache
        .update(EntityType::Recipe, "srv-1", patch(json!({"name": "Dunkel"})))
        .await
        .unwrap();
    assert_eq!(cache.pending_count().await, 2);

    let report = background.await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(
        count_calls(&remote, |c| matches!(c, RemoteCall::Update { .. })),
        2
    );

    let server: Recipe = remote
        .get(EntityType::Recipe, "srv-1")
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(server.name, "Dunkel");
    assert_eq!(server.version, 3);
    assert_eq!(cache.pending_count().await, 0);
}

#[tokio::test]
async fn test_delete_while_update_in_flight_wins_over_server_edit() {
    let remote = Arc::new(InMemoryRemote::new());
    let cache = device(&remote).await;
    cache
        .create(
            Recipe::new("Amber", "user1")
                .with_efficiency(70.0)
                .into_entity(),
        )
        .await
        .unwrap();
    cache.sync().await;

    remote.server_update(EntityType::Recipe, "srv-1", &patch(json!({"efficiency": 80.0})));
    cache
        .update(EntityType::Recipe, "srv-1", patch(json!({"efficiency": 75.0})))
        .await
        .unwrap();

    remote.set_delay(Some(Duration::from_millis(200)));
    let background = {
        let cache = cache.clone();
        tokio::spawn(async move { cache.sync().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The update is on the wire and will come back with a version mismatch.
    cache.delete(EntityType::Recipe, "srv-1").await.unwrap();
    let report = background.await.unwrap();
    assert_eq!(report.conflicted, 0);

    remote.set_delay(None);
    cache.sync().await;

    assert_eq!(cache.conflict_count().await, 0);
    assert_eq!(cache.pending_count().await, 0);
    assert!(cache.get(EntityType::Recipe, "srv-1").await.is_none());
    assert!(remote.get(EntityType::Recipe, "srv-1").is_none());
}

#[tokio::test]
async fn test_concurrent_syncs_never_overlap() {
    let remote = Arc::new(InMemoryRemote::new());
    let cache = device(&remote).await;
    for name in ["Porter", "Bock", "Kolsch"] {
        cache
            .create(Recipe::new(name, "user1").into_entity())
            .await
            .unwrap();
    }

    remote.set_delay(Some(Duration::from_millis(20)));
    let (a, b, c) = tokio::join!(cache.sync(), cache.sync(), cache.sync());

    assert_eq!(remote.max_concurrent_calls(), 1);
    assert_eq!(remote.record_count(EntityType::Recipe), 3);
    assert_eq!(
        count_calls(&remote, |c| matches!(c, RemoteCall::Create { .. })),
        3
    );
    assert_eq!(a.pushed + b.pushed + c.pushed, 3);
    assert_eq!(cache.pending_count().await, 0);
}

#[tokio::test]
async fn test_pulling_the_same_changes_twice_is_idempotent() {
    let remote = Arc::new(InMemoryRemote::new());
    let storage = Arc::new(MemoryStorage::new());
    remote.server_upsert(Recipe::new("Witbier", "user1").into_entity());
    remote.server_upsert(Recipe::new("Tripel", "user1").into_entity());

    let cache = open(&storage, &remote).await;
    let report = cache.refresh().await;
    assert_eq!(report.pulled, 2);
    let mut first = cache.list(EntityType::Recipe).await.unwrap();
    first.sort_by(|a, b| a.id().cmp(b.id()));
    drop(cache);

    // Forget the cursor so the whole history is replayed.
    storage
        .remove_item(&SessionContext::new("user1", storage.clone()).key("sync_state"))
        .await
        .unwrap();

    let cache = open(&storage, &remote).await;
    assert!(cache.status().await.cursor.is_none());
    cache.refresh().await;
    let mut second = cache.list(EntityType::Recipe).await.unwrap();
    second.sort_by(|a, b| a.id().cmp(b.id()));

    assert_eq!(first, second);
    assert_eq!(cache.pending_count().await, 0);
    assert_eq!(cache.conflict_count().await, 0);
}

#[tokio::test]
async fn test_competing_edits_surface_one_conflict() {
    let remote = Arc::new(InMemoryRemote::new());
    let phone = device(&remote).await;
    let tablet = device(&remote).await;

    phone
        .create(
            Recipe::new("West Coast IPA", "user1")
                .with_efficiency(75.0)
                .into_entity(),
        )
        .await
        .unwrap();
    phone.sync().await;
    tablet.refresh().await;
    assert!(tablet.get(EntityType::Recipe, "srv-1").await.is_some());

    phone
        .update(EntityType::Recipe, "srv-1", patch(json!({"efficiency": 72.0})))
        .await
        .unwrap();
    phone.sync().await;

    tablet
        .update(EntityType::Recipe, "srv-1", patch(json!({"efficiency": 80.0})))
        .await
        .unwrap();
    let report = tablet.sync().await;
    assert_eq!(report.conflicted, 1);
    assert_eq!(tablet.conflict_count().await, 1);
    assert_eq!(tablet.sync_state("srv-1").await, SyncState::Conflict);

    // Neither side is silently overwritten.
    let local: Recipe = tablet
        .get(EntityType::Recipe, "srv-1")
        .await
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(local.efficiency, Some(80.0));
    let server: Recipe = remote
        .get(EntityType::Recipe, "srv-1")
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(server.efficiency, Some(72.0));

    // Syncing again does not duplicate the conflict.
    tablet.sync().await;
    assert_eq!(tablet.conflict_count().await, 1);

    let conflict = tablet.conflicts().await.remove(0);
    assert_eq!(conflict.conflicting_fields(), vec!["efficiency".to_string()]);

    tablet
        .resolve_conflict(EntityType::Recipe, "srv-1", Resolution::KeepLocal)
        .await
        .unwrap();
    assert_eq!(tablet.conflict_count().await, 0);
    let report = tablet.sync().await;
    assert_eq!(report.pushed, 1);

    phone.refresh().await;
    let seen: Recipe = phone
        .get(EntityType::Recipe, "srv-1")
        .await
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(seen.efficiency, Some(80.0));
    assert_eq!(seen.version, 3);
}

#[tokio::test]
async fn test_edits_to_different_fields_merge() {
    let remote = Arc::new(InMemoryRemote::new());
    let phone = device(&remote).await;
    let tablet = device(&remote).await;

    phone
        .create(Recipe::new("Saison", "user1").into_entity())
        .await
        .unwrap();
    phone.sync().await;
    tablet.refresh().await;

    phone
        .update(EntityType::Recipe, "srv-1", patch(json!({"style": "Farmhouse"})))
        .await
        .unwrap();
    phone.sync().await;

    tablet
        .update(EntityType::Recipe, "srv-1", patch(json!({"boil_time": 90})))
        .await
        .unwrap();
    let report = tablet.sync().await;
    assert_eq!(report.conflicted, 0);
    assert_eq!(report.pushed, 1);

    let server: Recipe = remote
        .get(EntityType::Recipe, "srv-1")
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(server.style, "Farmhouse");
    assert_eq!(server.boil_time, Some(90));

    let local: Recipe = tablet
        .get(EntityType::Recipe, "srv-1")
        .await
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(local, server);
}

#[tokio::test]
async fn test_rejected_operation_is_parked_until_retried() {
    let remote = Arc::new(InMemoryRemote::new());
    let cache = device(&remote).await;
    cache
        .create(Recipe::new("Gose", "user1").into_entity())
        .await
        .unwrap();

    remote.fail_next(brewtracker_core::RemoteError::Http {
        status: 422,
        message: "rejected".to_string(),
    });
    let report = cache.sync().await;
    assert_eq!(report.failed, 1);
    assert_eq!(cache.pending_count().await, 1);

    let failed = cache.failed_operations().await;
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.is_some());

    // Parked operations are not retried automatically.
    assert_eq!(cache.sync().await.pushed, 0);

    assert!(cache.retry_failed(&failed[0].id).await);
    assert_eq!(cache.sync().await.pushed, 1);
    assert_eq!(cache.pending_count().await, 0);
    assert_eq!(remote.record_count(EntityType::Recipe), 1);
}

#[tokio::test]
async fn test_queue_survives_restart_once_flushed() {
    let remote = Arc::new(InMemoryRemote::new());
    let storage = Arc::new(MemoryStorage::new());
    remote.set_online(false);

    let cache = open(&storage, &remote).await;
    cache
        .create(Recipe::new("Kveik Pale", "user1").into_entity())
        .await
        .unwrap();
    drop(cache);

    let cache = open(&storage, &remote).await;
    assert_eq!(cache.pending_count().await, 1);

    remote.set_online(true);
    assert_eq!(cache.sync().await.pushed, 1);
    assert!(cache.get(EntityType::Recipe, "srv-1").await.is_some());
}

#[tokio::test]
async fn test_unpersisted_mutation_is_lost_on_restart() {
    let remote = Arc::new(InMemoryRemote::new());
    let storage = Arc::new(MemoryStorage::new());
    let cache = open(&storage, &remote).await;

    storage.set_fail_writes(true);
    let recipe = cache
        .create(Recipe::new("Hefeweizen", "user1").into_entity())
        .await
        .unwrap();
    assert!(cache.last_error().is_some());
    assert!(cache.get(EntityType::Recipe, recipe.id()).await.is_some());
    assert_eq!(cache.pending_count().await, 1);
    drop(cache);

    storage.set_fail_writes(false);
    let cache = open(&storage, &remote).await;
    assert_eq!(cache.pending_count().await, 0);
    assert!(cache.get(EntityType::Recipe, recipe.id()).await.is_none());
}

#[tokio::test]
async fn test_other_users_records_are_rejected() {
    let remote = Arc::new(InMemoryRemote::new());
    let storage = Arc::new(MemoryStorage::new());
    let cache = open(&storage, &remote).await;

    let err = cache
        .create(Recipe::new("Not Mine", "user2").into_entity())
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Scope { .. }));
    assert_eq!(cache.pending_count().await, 0);

    cache
        .create(Recipe::new("Mine", "user1").into_entity())
        .await
        .unwrap();
    let other = UserCache::open(
        SessionContext::new("user2", storage.clone()),
        remote.clone(),
        CacheConfig::default(),
    )
    .await
    .unwrap();
    assert!(other.list(EntityType::Recipe).await.unwrap().is_empty());
    assert_eq!(other.pending_count().await, 0);
}
