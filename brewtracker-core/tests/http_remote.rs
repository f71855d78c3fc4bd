//! `HttpRemote` against a small axum backend bound to an ephemeral port.

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use brewtracker_core::{
    CacheConfig, Cursor, Entity, EntityType, HttpRemote, InMemoryRemote, MemoryStorage, Patch,
    Recipe, Record, RemoteApi, RemoteError, SessionContext, SyncState, UserCache,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

const API_KEY: &str = "test-key";

type Backend = Arc<InMemoryRemote>;

#[derive(Deserialize)]
struct UpdateBody {
    patch: Patch,
    expected_version: u64,
}

#[derive(Deserialize)]
struct DeleteQuery {
    expected_version: Option<u64>,
}

#[derive(Deserialize)]
struct ChangesQuery {
    cursor: Option<String>,
}

fn error_response(error: RemoteError) -> Response {
    match error {
        RemoteError::VersionMismatch { current } => {
            (StatusCode::CONFLICT, Json(json!({ "current": current }))).into_response()
        }
        RemoteError::NotFound => StatusCode::NOT_FOUND.into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

fn entity_type(raw: &str) -> Result<EntityType, Response> {
    EntityType::parse(raw).ok_or_else(|| StatusCode::NOT_FOUND.into_response())
}

async fn create(State(backend): State<Backend>, Json(entity): Json<Entity>) -> Response {
    match backend.create(&entity).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn fetch(
    State(backend): State<Backend>,
    Path((kind, id)): Path<(String, String)>,
) -> Response {
    let entity_type = match entity_type(&kind) {
        Ok(t) => t,
        Err(response) => return response,
    };
    match backend.fetch(entity_type, &id).await {
        Ok(Some(entity)) => Json(entity).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

async fn update(
    State(backend): State<Backend>,
    Path((kind, id)): Path<(String, String)>,
    Json(body): Json<UpdateBody>,
) -> Response {
    let entity_type = match entity_type(&kind) {
        Ok(t) => t,
        Err(response) => return response,
    };
    match backend
        .update(entity_type, &id, &body.patch, body.expected_version)
        .await
    {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete(
    State(backend): State<Backend>,
    Path((kind, id)): Path<(String, String)>,
    Query(query): Query<DeleteQuery>,
) -> Response {
    let entity_type = match entity_type(&kind) {
        Ok(t) => t,
        Err(response) => return response,
    };
    match backend
        .delete(entity_type, &id, query.expected_version)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

async fn changes(State(backend): State<Backend>, Query(query): Query<ChangesQuery>) -> Response {
    let cursor = query.cursor.map(Cursor);
    match backend.changes_since(cursor.as_ref()).await {
        Ok(changes) => Json(changes).into_response(),
        Err(e) => error_response(e),
    }
}

async fn require_key(request: Request, next: Next) -> Response {
    let expected = format!("Bearer {}", API_KEY);
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    next.run(request).await
}

/// Serves `backend` on 127.0.0.1 and returns the base URL.
async fn serve(backend: Backend) -> String {
    let app = Router::new()
        .route("/api/sync/changes", get(changes))
        .route("/api/{kind}", post(create))
        .route("/api/{kind}/{id}", get(fetch).patch(update).delete(delete))
        .layer(middleware::from_fn(require_key))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn open(remote: HttpRemote) -> UserCache {
    let session = SessionContext::new("user1", Arc::new(MemoryStorage::new()));
    UserCache::open(session, Arc::new(remote), CacheConfig::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_sync_round_trip_over_http() {
    let backend = Arc::new(InMemoryRemote::new().with_next_id(41));
    let url = serve(backend.clone()).await;
    let cache = open(HttpRemote::new(url, API_KEY)).await;

    let recipe = cache
        .create(Recipe::new("Amber Ale", "user1").into_entity())
        .await
        .unwrap();
    let report = cache.sync().await;
    assert!(report.is_success(), "{report:?}");
    assert_eq!(report.pushed, 1);
    assert!(cache.get(EntityType::Recipe, recipe.id()).await.is_none());
    assert_eq!(cache.sync_state("srv-42").await, SyncState::Synced);

    cache
        .update(
            EntityType::Recipe,
            "srv-42",
            json!({"style": "American Amber"}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();
    cache.sync().await;
    let server: Recipe = backend
        .get(EntityType::Recipe, "srv-42")
        .and_then(|e| e.into_record())
        .unwrap();
    assert_eq!(server.style, "American Amber");
    assert_eq!(server.version, 2);

    backend.server_upsert(Recipe::new("Brown Ale", "user1").into_entity());
    let report = cache.refresh().await;
    assert_eq!(report.pulled, 1);
    assert_eq!(cache.list(EntityType::Recipe).await.unwrap().len(), 2);

    assert!(cache.delete(EntityType::Recipe, "srv-42").await.unwrap());
    cache.sync().await;
    assert!(backend.get(EntityType::Recipe, "srv-42").is_none());
    assert_eq!(cache.pending_count().await, 0);
}

#[tokio::test]
async fn test_stale_update_becomes_conflict_over_http() {
    let backend = Arc::new(InMemoryRemote::new());
    let url = serve(backend.clone()).await;
    let cache = open(HttpRemote::new(url, API_KEY)).await;

    backend.server_upsert(
        Recipe::new("Barleywine", "user1")
            .with_boil_time(90)
            .into_entity(),
    );
    cache.refresh().await;

    backend.server_update(
        EntityType::Recipe,
        "srv-1",
        json!({"boil_time": 120}).as_object().unwrap(),
    );
    cache
        .update(
            EntityType::Recipe,
            "srv-1",
            json!({"boil_time": 60}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();

    let report = cache.sync().await;
    assert_eq!(report.conflicted, 1);
    let conflict = cache.conflicts().await.remove(0);
    assert_eq!(conflict.server_snapshot.unwrap().version(), 2);
    assert_eq!(cache.sync_state("srv-1").await, SyncState::Conflict);
}

#[tokio::test]
async fn test_wrong_api_key_parks_operation() {
    let backend = Arc::new(InMemoryRemote::new());
    let url = serve(backend.clone()).await;
    let cache = open(HttpRemote::new(url, "wrong-key")).await;

    cache
        .create(Recipe::new("Rauchbier", "user1").into_entity())
        .await
        .unwrap();
    let report = cache.sync().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.pull_error, Some(RemoteError::Unauthorized));
    assert_eq!(cache.failed_operations().await.len(), 1);
    assert_eq!(backend.record_count(EntityType::Recipe), 0);
}

#[tokio::test]
async fn test_unreachable_server_is_offline() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let remote = HttpRemote::new(format!("http://{}", addr), API_KEY);
    let err = remote.changes_since(None).await.unwrap_err();
    assert_eq!(err, RemoteError::Offline);
    assert!(err.is_retryable());

    let cache = open(remote).await;
    cache
        .create(Recipe::new("Altbier", "user1").into_entity())
        .await
        .unwrap();
    let report = cache.sync().await;
    assert_eq!(report.retried, 1);
    assert_eq!(cache.pending_count().await, 1);
    assert!(cache.failed_operations().await.is_empty());
}

#[tokio::test]
async fn test_remote_calls_map_status_codes() {
    let backend = Arc::new(InMemoryRemote::new());
    let url = serve(backend.clone()).await;
    let remote = HttpRemote::new(url, API_KEY);

    assert_eq!(remote.fetch(EntityType::Recipe, "srv-9").await, Ok(None));
    assert_eq!(
        remote.delete(EntityType::Recipe, "srv-9", None).await,
        Err(RemoteError::NotFound)
    );

    let created = remote
        .create(&Recipe::new("Mild", "user1").into_entity())
        .await
        .unwrap();
    assert_eq!(created.id(), "srv-1");
    assert_eq!(
        remote.fetch(EntityType::Recipe, "srv-1").await.unwrap(),
        Some(created.clone())
    );

    match remote.delete(EntityType::Recipe, "srv-1", Some(7)).await {
        Err(RemoteError::VersionMismatch { current }) => {
            assert_eq!(current.map(|c| c.version()), Some(1))
        }
        other => panic!("unexpected result: {other:?}"),
    }

    let changes = remote.changes_since(None).await.unwrap();
    assert_eq!(changes.changes.len(), 1);
    assert_eq!(changes.cursor, Cursor("1".to_string()));
    let next = remote.changes_since(Some(&changes.cursor)).await.unwrap();
    assert!(next.changes.is_empty());
}
