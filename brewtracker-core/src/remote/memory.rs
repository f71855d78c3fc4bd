//! In-process backend with the same contract as the REST API.
//!
//! Used by tests and demos: deterministic server ids (`srv-<n>`), a change
//! journal whose sequence number serves as the cursor, and knobs for
//! connectivity, injected failures, latency and edits made by "another
//! device".

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Change, ChangeSet, Cursor, RemoteApi, RemoteError};
use crate::models::{Entity, EntityType, Patch};

/// A call received by [`InMemoryRemote`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Create { entity_type: EntityType, id: String },
    Update { entity_type: EntityType, id: String },
    Delete { entity_type: EntityType, id: String },
    Fetch { entity_type: EntityType, id: String },
    Changes { cursor: Option<String> },
}

#[derive(Default)]
struct ServerState {
    records: BTreeMap<(EntityType, String), Entity>,
    journal: Vec<(u64, Change)>,
    seq: u64,
    next_id: u64,
    failures: VecDeque<RemoteError>,
    calls: Vec<RemoteCall>,
    delay: Option<Duration>,
    page_size: Option<usize>,
    changes_failure: Option<RemoteError>,
}

impl ServerState {
    fn record(&mut self, change: Change) {
        self.seq += 1;
        self.journal.push((self.seq, change));
    }

    fn upsert(&mut self, entity: Entity) -> Entity {
        self.records
            .insert((entity.entity_type(), entity.id().to_string()), entity.clone());
        self.record(Change::Upsert {
            entity: entity.clone(),
        });
        entity
    }

    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        format!("srv-{}", self.next_id)
    }
}

pub struct InMemoryRemote {
    state: Mutex<ServerState>,
    online: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Tracks concurrent requests for the duration of one call.
struct InFlight<'a>(&'a InMemoryRemote);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            online: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Starts server ids after `n`, e.g. `with_next_id(41)` hands out `srv-42` first.
    pub fn with_next_id(self, n: u64) -> Self {
        self.lock().next_id = n;
        self
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// The next call fails with `error` (queued failures are consumed in order).
    pub fn fail_next(&self, error: RemoteError) {
        self.lock().failures.push_back(error);
    }

    /// Makes every `changes_since` call fail with `error` until cleared.
    pub fn fail_changes(&self, error: Option<RemoteError>) {
        self.lock().changes_failure = error;
    }

    /// Every call sleeps for `delay` before being handled.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Limits how many changes one `changes_since` call returns.
    pub fn set_page_size(&self, page_size: Option<usize>) {
        self.lock().page_size = page_size;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Highest number of calls observed running at the same time.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<Entity> {
        self.lock()
            .records
            .get(&(entity_type, id.to_string()))
            .cloned()
    }

    pub fn record_count(&self, entity_type: EntityType) -> usize {
        self.lock()
            .records
            .keys()
            .filter(|(t, _)| *t == entity_type)
            .count()
    }

    /// Writes a record directly, as another device would. Assigns an id if
    /// the record has none and bumps the version.
    pub fn server_upsert(&self, mut entity: Entity) -> Entity {
        let mut state = self.lock();
        if entity.id().is_empty() || crate::models::is_local_id(entity.id()) {
            let id = state.assign_id();
            entity.set_id(id);
        }
        let previous = state
            .records
            .get(&(entity.entity_type(), entity.id().to_string()))
            .map_or(0, |e| e.version());
        entity.set_version(previous + 1);
        entity.touch();
        state.upsert(entity)
    }

    /// Patches a stored record as another device would.
    pub fn server_update(&self, entity_type: EntityType, id: &str, patch: &Patch) -> Option<Entity> {
        let mut state = self.lock();
        let current = state.records.get(&(entity_type, id.to_string()))?;
        let mut updated = current.apply_patch(patch).ok()?;
        updated.set_version(current.version() + 1);
        updated.touch();
        Some(state.upsert(updated))
    }

    pub fn server_delete(&self, entity_type: EntityType, id: &str) -> bool {
        let mut state = self.lock();
        if state.records.remove(&(entity_type, id.to_string())).is_none() {
            return false;
        }
        state.record(Change::Delete {
            entity_type,
            id: id.to_string(),
        });
        true
    }

    /// Journals the call, applies connectivity, injected failures and delay.
    async fn begin(&self, call: RemoteCall) -> Result<InFlight<'_>, RemoteError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(call);
            if !self.is_online() {
                return Err(RemoteError::Offline);
            }
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            state.delay
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(self);

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(guard)
    }
}

impl Default for InMemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemote {
    async fn create(&self, entity: &Entity) -> Result<Entity, RemoteError> {
        let _guard = self
            .begin(RemoteCall::Create {
                entity_type: entity.entity_type(),
                id: entity.id().to_string(),
            })
            .await?;

        let mut state = self.lock();
        let mut created = entity.clone();
        let id = state.assign_id();
        created.set_id(id);
        created.set_version(1);
        created.touch();
        Ok(state.upsert(created))
    }

    async fn update(
        &self,
        entity_type: EntityType,
        id: &str,
        patch: &Patch,
        expected_version: u64,
    ) -> Result<Entity, RemoteError> {
        let _guard = self
            .begin(RemoteCall::Update {
                entity_type,
                id: id.to_string(),
            })
            .await?;

        let mut state = self.lock();
        let current = state
            .records
            .get(&(entity_type, id.to_string()))
            .ok_or(RemoteError::NotFound)?;
        if current.version() != expected_version {
            return Err(RemoteError::VersionMismatch {
                current: Some(Box::new(current.clone())),
            });
        }

        let mut updated = current.apply_patch(patch).map_err(|e| RemoteError::Http {
            status: 422,
            message: e.to_string(),
        })?;
        updated.set_version(current.version() + 1);
        updated.touch();
        Ok(state.upsert(updated))
    }

    async fn delete(
        &self,
        entity_type: EntityType,
        id: &str,
        expected_version: Option<u64>,
    ) -> Result<(), RemoteError> {
        let _guard = self
            .begin(RemoteCall::Delete {
                entity_type,
                id: id.to_string(),
            })
            .await?;

        let mut state = self.lock();
        let key = (entity_type, id.to_string());
        let current = state.records.get(&key).ok_or(RemoteError::NotFound)?;
        if matches!(expected_version, Some(v) if v != current.version()) {
            return Err(RemoteError::VersionMismatch {
                current: Some(Box::new(current.clone())),
            });
        }

        state.records.remove(&key);
        state.record(Change::Delete {
            entity_type,
            id: id.to_string(),
        });
        Ok(())
    }

    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<Option<Entity>, RemoteError> {
        let _guard = self
            .begin(RemoteCall::Fetch {
                entity_type,
                id: id.to_string(),
            })
            .await?;
        Ok(self.lock().records.get(&(entity_type, id.to_string())).cloned())
    }

    async fn changes_since(&self, cursor: Option<&Cursor>) -> Result<ChangeSet, RemoteError> {
        let _guard = self
            .begin(RemoteCall::Changes {
                cursor: cursor.map(|c| c.0.clone()),
            })
            .await?;

        let after = match cursor {
            Some(cursor) => cursor
                .as_str()
                .parse::<u64>()
                .map_err(|_| RemoteError::Http {
                    status: 400,
                    message: format!("bad cursor: {}", cursor),
                })?,
            None => 0,
        };

        let state = self.lock();
        if let Some(error) = &state.changes_failure {
            return Err(error.clone());
        }
        let pending: Vec<&(u64, Change)> =
            state.journal.iter().filter(|(seq, _)| *seq > after).collect();
        let limit = state.page_size.unwrap_or(usize::MAX).max(1);
        let page = &pending[..pending.len().min(limit)];

        let last_seq = page.last().map_or(after, |(seq, _)| *seq);
        Ok(ChangeSet {
            changes: page.iter().map(|(_, change)| change.clone()).collect(),
            cursor: Cursor(last_seq.to_string()),
            has_more: pending.len() > page.len(),
        })
    }
}
