//! The sync engine: drains pending operations, pulls server changes and
//! reconciles both into the local cache.
//!
//! A cycle runs `Idle -> Draining -> Pulling -> Reconciling -> Idle`. The
//! cache state lock is taken around each local step and released before every
//! network call, so hooks keep reading and writing while a request is on the
//! wire. Cycles never overlap: `sync` and `refresh` are serialized behind one
//! gate.

use chrono::Utc;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use crate::cache::CacheState;
use crate::conflict::{Conflict, ConflictDetector, Outcome};
use crate::events::{CacheEvent, EventBus};
use crate::models::{Entity, EntityType, Patch};
use crate::oplog::{FailOutcome, OperationKind, PendingOperation};
use crate::remote::{Change, Cursor, RemoteApi, RemoteError};

/// Upper bound on change pages fetched in one pull.
const MAX_PULL_PAGES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Idle,
    Draining,
    Pulling,
    Reconciling,
}

/// What one sync cycle did.
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    /// Operations the server confirmed.
    pub pushed: usize,
    /// Operations parked as permanent failures.
    pub failed: usize,
    /// Operations scheduled for another attempt.
    pub retried: usize,
    /// New conflicts detected.
    pub conflicted: usize,
    /// Server changes applied to the store.
    pub pulled: usize,
    pub cursor_advanced: bool,
    pub pull_error: Option<RemoteError>,
    pub storage_error: Option<String>,
}

impl SyncReport {
    /// True when nothing failed, was deferred, or went unpulled.
    pub fn is_success(&self) -> bool {
        self.failed == 0
            && self.retried == 0
            && self.pull_error.is_none()
            && self.storage_error.is_none()
    }
}

/// Per-drain bookkeeping.
#[derive(Default)]
struct DrainContext {
    /// Entities not to touch again in this drain.
    blocked: HashSet<String>,
    /// Operations already re-based once in this drain.
    rebased: HashSet<String>,
}

enum Flow {
    Continue,
    Stop,
}

pub struct SyncEngine {
    state: Arc<Mutex<CacheState>>,
    remote: Arc<dyn RemoteApi>,
    events: EventBus,
    request_timeout: Duration,
    phase: watch::Sender<SyncPhase>,
    /// Serializes cycles and holds the report of the last `sync`.
    gate: Mutex<Option<SyncReport>>,
    requested: AtomicU64,
    started: AtomicU64,
}

impl SyncEngine {
    pub fn new(
        state: Arc<Mutex<CacheState>>,
        remote: Arc<dyn RemoteApi>,
        events: EventBus,
        request_timeout: Duration,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            state,
            remote,
            events,
            request_timeout,
            phase,
            gate: Mutex::new(None),
            requested: AtomicU64::new(0),
            started: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    /// Runs a full cycle: drain, pull, reconcile.
    ///
    /// Calls made while a cycle is running wait for it. Once it finishes, the
    /// first waiter starts one new cycle on behalf of every request issued so
    /// far; the other waiters receive that cycle's report.
    pub async fn sync(&self) -> SyncReport {
        let ticket = self.requested.fetch_add(1, Ordering::SeqCst) + 1;
        let mut last_report = self.gate.lock().await;

        if self.started.load(Ordering::SeqCst) >= ticket {
            if let Some(report) = last_report.as_ref() {
                tracing::debug!(ticket, "sync request already covered");
                return report.clone();
            }
        }

        self.started
            .store(self.requested.load(Ordering::SeqCst), Ordering::SeqCst);
        let report = self.run_cycle(true).await;
        *last_report = Some(report.clone());
        report
    }

    /// Pulls and reconciles without sending pending operations.
    pub async fn refresh(&self) -> SyncReport {
        let _gate = self.gate.lock().await;
        self.run_cycle(false).await
    }

    async fn run_cycle(&self, drain: bool) -> SyncReport {
        let mut report = SyncReport::default();
        self.events.emit(CacheEvent::SyncStarted);
        tracing::info!(drain, "sync cycle started");

        if drain {
            self.set_phase(SyncPhase::Draining);
            self.drain(&mut report).await;
        }

        self.set_phase(SyncPhase::Pulling);
        let cursor = self.pull(&mut report).await;

        self.set_phase(SyncPhase::Reconciling);
        self.reconcile(cursor, &mut report).await;

        self.set_phase(SyncPhase::Idle);
        tracing::info!(
            pushed = report.pushed,
            failed = report.failed,
            retried = report.retried,
            conflicted = report.conflicted,
            pulled = report.pulled,
            cursor_advanced = report.cursor_advanced,
            "sync cycle finished"
        );
        self.events.emit(CacheEvent::SyncFinished {
            success: report.is_success(),
        });
        report
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    /// Bounds a remote call by the request timeout.
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .unwrap_or(Err(RemoteError::Timeout))
    }

    // Draining

    async fn drain(&self, report: &mut SyncReport) {
        let mut ctx = DrainContext::default();

        loop {
            let op = {
                let mut state = self.state.lock().await;
                let mut skip = ctx.blocked.clone();
                skip.extend(state.conflicts.entity_ids().cloned());
                match state.log.dequeue_next(Utc::now(), &skip) {
                    Some(op) => op,
                    None => break,
                }
            };

            tracing::debug!(op_id = %op.id, entity_id = %op.entity_id, kind = ?op.kind, "sending");
            let result = self.push(&op).await;

            let mut state = self.state.lock().await;
            let flow = self
                .settle(&mut state, &op, result, report, &mut ctx)
                .await;
            let session = state.store.session().clone();
            if let Err(e) = state.log.flush(&session).await {
                tracing::warn!(error = %e, "failed to persist pending operations");
            }
            state.publish_counts(&self.events);

            if matches!(flow, Flow::Stop) {
                break;
            }
        }
    }

    /// Sends one operation. A version mismatch always comes back with the
    /// server's current copy, or `None` if the server no longer has the record.
    async fn push(&self, op: &PendingOperation) -> Result<Option<Entity>, RemoteError> {
        let result = match op.kind {
            OperationKind::Create => {
                let entity = op.entity().ok_or_else(|| {
                    RemoteError::InvalidRequest("malformed create payload".to_string())
                })?;
                self.call(self.remote.create(&entity)).await.map(Some)
            }
            OperationKind::Update => {
                let patch = op.patch().ok_or_else(|| {
                    RemoteError::InvalidRequest("malformed update payload".to_string())
                })?;
                let expected = op.base_version.unwrap_or(0);
                let request = self
                    .remote
                    .update(op.entity_type, &op.entity_id, patch, expected);
                match self.call(request).await {
                    Ok(entity) => return Ok(Some(entity)),
                    Err(RemoteError::NotFound) => {
                        return Err(RemoteError::VersionMismatch { current: None })
                    }
                    Err(e) => Err(e),
                }
            }
            OperationKind::Delete => {
                let request = self
                    .remote
                    .delete(op.entity_type, &op.entity_id, op.base_version);
                match self.call(request).await {
                    Ok(()) | Err(RemoteError::NotFound) => return Ok(None),
                    Err(e) => Err(e),
                }
            }
        };

        match result {
            Err(RemoteError::VersionMismatch { current: None }) => {
                let current = self
                    .call(self.remote.fetch(op.entity_type, &op.entity_id))
                    .await?;
                Err(RemoteError::VersionMismatch {
                    current: current.map(Box::new),
                })
            }
            other => other,
        }
    }

    /// Applies the outcome of one push to the cache.
    async fn settle(
        &self,
        state: &mut CacheState,
        op: &PendingOperation,
        result: Result<Option<Entity>, RemoteError>,
        report: &mut SyncReport,
        ctx: &mut DrainContext,
    ) -> Flow {
        match result {
            Ok(server) => {
                state.log.ack(&op.id);
                report.pushed += 1;
                if let Some(server) = server {
                    self.confirm(state, op, server).await;
                }
                Flow::Continue
            }
            Err(RemoteError::VersionMismatch { current }) => {
                let current = current.map(|c| *c);
                self.handle_mismatch(state, op, current, report, ctx).await;
                Flow::Continue
            }
            Err(RemoteError::Offline) => {
                // Never reached the server; not an attempt.
                state.log.release(&op.id);
                report.retried += 1;
                tracing::info!("server unreachable; stopping drain");
                Flow::Stop
            }
            Err(e) => {
                ctx.blocked.insert(op.entity_id.clone());
                match state.log.fail(&op.id, e.is_retryable(), e.to_string(), Utc::now()) {
                    Some(FailOutcome::Retrying { .. }) => report.retried += 1,
                    Some(FailOutcome::Exhausted { .. }) => report.failed += 1,
                    None => {}
                }
                Flow::Continue
            }
        }
    }

    /// Stores the server's confirmed copy, adopting its id for a create.
    async fn confirm(&self, state: &mut CacheState, op: &PendingOperation, server: Entity) {
        let server_id = server.id().to_string();

        if op.kind == OperationKind::Create && op.entity_id != server_id {
            tracing::debug!(from = %op.entity_id, to = %server_id, "adopting server id");
            if let Err(e) = state
                .store
                .remap_id(op.entity_type, &op.entity_id, &server_id)
                .await
            {
                tracing::warn!(error = %e, "failed to persist id remap");
            }
            state
                .log
                .remap_entity(&op.entity_id, &server_id, server.version());
            state.conflicts.remap(&op.entity_id, &server_id);
        }

        if let Ok(fields) = server.fields() {
            state.log.rebase(&server_id, server.version(), &fields);
        }
        self.store_server_copy(state, server).await;
    }

    async fn handle_mismatch(
        &self,
        state: &mut CacheState,
        op: &PendingOperation,
        current: Option<Entity>,
        report: &mut SyncReport,
        ctx: &mut DrainContext,
    ) {
        let outcome = ConflictDetector::check(op, current.as_ref());
        tracing::debug!(op_id = %op.id, ?outcome, "version mismatch");

        match (outcome, current) {
            (Outcome::Conflict, current) => {
                state.log.release(&op.id);
                if self.record_conflict(state, op.entity_type, &op.entity_id, current) {
                    report.conflicted += 1;
                }
            }
            (_, None) => {
                // Deleting a record the server no longer has.
                state.log.ack(&op.id);
                report.pushed += 1;
            }
            (_, Some(server)) if ctx.rebased.insert(op.id.clone()) => {
                // Re-based on the server's version and sent again in this drain.
                state.log.release(&op.id);
                if let Ok(fields) = server.fields() {
                    state.log.rebase(&op.entity_id, server.version(), &fields);
                }
                if op.kind == OperationKind::Update {
                    self.store_server_copy(state, server).await;
                }
            }
            (_, Some(_)) => {
                ctx.blocked.insert(op.entity_id.clone());
                match state
                    .log
                    .fail(&op.id, true, "server kept changing during sync", Utc::now())
                {
                    Some(FailOutcome::Exhausted { .. }) => report.failed += 1,
                    _ => report.retried += 1,
                }
            }
        }
    }

    /// Turns the entity's queued updates into a conflict record. The store
    /// keeps the local copy until the conflict is resolved.
    ///
    /// A queued local delete supersedes the updates instead: they are
    /// dropped and the delete is re-based on the server's version.
    fn record_conflict(
        &self,
        state: &mut CacheState,
        entity_type: EntityType,
        entity_id: &str,
        server: Option<Entity>,
    ) -> bool {
        if state
            .log
            .for_entity(entity_id)
            .any(|o| o.kind == OperationKind::Delete)
        {
            self.supersede_updates(state, entity_id, server.as_ref());
            return false;
        }

        let updates: Vec<PendingOperation> = state
            .log
            .for_entity(entity_id)
            .filter(|o| o.kind == OperationKind::Update && !o.is_in_flight())
            .cloned()
            .collect();
        if updates.is_empty() {
            return false;
        }

        let base_version = updates[0].base_version;
        let mut patch = Patch::new();
        for op in &updates {
            if let Some(p) = op.patch() {
                patch.extend(p.clone());
            }
            state.log.remove(&op.id);
        }

        let local = state
            .store
            .get(entity_type, entity_id)
            .cloned()
            .or_else(|| server.as_ref().and_then(|s| s.apply_patch(&patch).ok()));
        let Some(local) = local else {
            tracing::warn!(%entity_id, "no local copy for conflicting change; dropping it");
            return false;
        };

        let was_new = !state.conflicts.contains(entity_id);
        state
            .conflicts
            .insert(Conflict::new(local, server, patch, base_version));
        was_new
    }

    fn supersede_updates(
        &self,
        state: &mut CacheState,
        entity_id: &str,
        server: Option<&Entity>,
    ) {
        let updates: Vec<String> = state
            .log
            .for_entity(entity_id)
            .filter(|o| o.kind == OperationKind::Update && !o.is_in_flight())
            .map(|o| o.id.clone())
            .collect();
        for op_id in &updates {
            state.log.remove(op_id);
        }
        if let Some(server) = server {
            if let Ok(fields) = server.fields() {
                state.log.rebase(entity_id, server.version(), &fields);
            }
        }
        tracing::debug!(
            %entity_id,
            dropped = updates.len(),
            "local delete supersedes diverged updates"
        );
    }

    /// Writes the server's copy with the entity's still-queued local changes
    /// layered on top. Skipped when a local delete is queued.
    async fn store_server_copy(&self, state: &mut CacheState, server: Entity) {
        let id = server.id().to_string();
        let mut local = server;

        for op in state.log.for_entity(&id) {
            match op.kind {
                OperationKind::Delete => return,
                OperationKind::Update => {
                    if let Some(patch) = op.patch() {
                        match local.apply_patch(patch) {
                            Ok(patched) => local = patched,
                            Err(e) => {
                                tracing::warn!(op_id = %op.id, error = %e, "cannot replay queued update")
                            }
                        }
                    }
                }
                OperationKind::Create => {}
            }
        }

        if let Err(e) = state.store.put(local).await {
            tracing::warn!(error = %e, entity_id = %id, "failed to store server copy");
        }
    }

    // Pulling

    /// Fetches and applies every change page after the stored cursor.
    /// Returns the new cursor, or `None` if the pull failed.
    async fn pull(&self, report: &mut SyncReport) -> Option<Cursor> {
        let mut cursor = self.state.lock().await.meta.cursor.clone();

        for page in 0..MAX_PULL_PAGES {
            let changes = match self.call(self.remote.changes_since(cursor.as_ref())).await {
                Ok(changes) => changes,
                Err(e) => {
                    tracing::warn!(error = %e, page, "pull failed; keeping previous cursor");
                    report.pull_error = Some(e);
                    return None;
                }
            };

            {
                let mut state = self.state.lock().await;
                for change in changes.changes {
                    self.apply_change(&mut state, change, report).await;
                }
            }

            cursor = Some(changes.cursor);
            if !changes.has_more {
                break;
            }
        }
        cursor
    }

    /// Applies one pulled change. Applying the same change twice leaves the
    /// cache as applying it once.
    async fn apply_change(&self, state: &mut CacheState, change: Change, report: &mut SyncReport) {
        match change {
            Change::Upsert { entity } => self.apply_upsert(state, entity, report).await,
            Change::Delete { entity_type, id } => {
                self.apply_delete(state, entity_type, &id, report).await
            }
        }
    }

    async fn apply_upsert(&self, state: &mut CacheState, server: Entity, report: &mut SyncReport) {
        let user_id = state.store.session().user_id().to_string();
        if server.user_id() != user_id {
            tracing::warn!(entity_id = %server.id(), owner = %server.user_id(), "ignoring change for another user");
            return;
        }
        let id = server.id().to_string();

        if state.conflicts.contains(&id) {
            state.conflicts.refresh_server(&id, Some(server));
            return;
        }

        let head = state.log.for_entity(&id).next().cloned();
        let Some(head) = head else {
            let stale = state
                .store
                .get(server.entity_type(), &id)
                .is_some_and(|local| local.version() >= server.version());
            if !stale {
                if let Err(e) = state.store.put(server).await {
                    tracing::warn!(error = %e, entity_id = %id, "failed to store pulled change");
                }
                report.pulled += 1;
            }
            return;
        };

        if matches!(head.base_version, Some(base) if base >= server.version()) {
            // Already based on this version or newer.
            return;
        }

        let check_against = state
            .log
            .for_entity(&id)
            .find(|o| o.kind == OperationKind::Update)
            .cloned()
            .unwrap_or(head);

        match ConflictDetector::check(&check_against, Some(&server)) {
            Outcome::Conflict => {
                if self.record_conflict(state, server.entity_type(), &id, Some(server)) {
                    report.conflicted += 1;
                }
            }
            Outcome::Applied | Outcome::Superseded => {
                if let Ok(fields) = server.fields() {
                    state.log.rebase(&id, server.version(), &fields);
                }
                self.store_server_copy(state, server).await;
                report.pulled += 1;
            }
        }
    }

    async fn apply_delete(
        &self,
        state: &mut CacheState,
        entity_type: EntityType,
        id: &str,
        report: &mut SyncReport,
    ) {
        if state.conflicts.contains(id) {
            state.conflicts.refresh_server(id, None);
            return;
        }

        let pending: Vec<PendingOperation> = state.log.for_entity(id).cloned().collect();
        if pending.iter().any(|o| o.kind == OperationKind::Update) {
            if self.record_conflict(state, entity_type, id, None) {
                report.conflicted += 1;
            }
        }
        // A queued delete is already satisfied.
        for op in pending
            .iter()
            .filter(|o| o.kind == OperationKind::Delete && !o.is_in_flight())
        {
            state.log.ack(&op.id);
        }

        if !state.conflicts.contains(id) {
            match state.store.remove(entity_type, id).await {
                Ok(true) => report.pulled += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, entity_id = %id, "failed to apply pulled delete"),
            }
        }
    }

    // Reconciling

    async fn reconcile(&self, cursor: Option<Cursor>, report: &mut SyncReport) {
        let mut state = self.state.lock().await;
        let session = state.store.session().clone();

        if let Some(cursor) = cursor {
            report.cursor_advanced = state.meta.cursor.as_ref() != Some(&cursor);
            state.meta.cursor = Some(cursor);
            state.meta.last_sync = Some(Utc::now());
            if let Err(e) = state.meta.save(&session).await {
                tracing::warn!(error = %e, "failed to persist sync cursor");
                report.storage_error = Some(e.to_string());
            }
        }

        if let Err(e) = state.persist().await {
            tracing::warn!(error = %e, "failed to persist cache after sync");
            report.storage_error = Some(e.to_string());
        }
        state.publish_counts(&self.events);
    }
}
