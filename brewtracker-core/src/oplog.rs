//! Pending operation log: mutations made locally that the server has not
//! confirmed yet.
//!
//! Operations are kept in FIFO order by `seq`, a counter assigned on
//! enqueue. `created_at` is informational only: a wall clock that steps
//! backwards must not reorder the queue. Each entity has at most one chain
//! of queued operations; new updates are coalesced into the tail of that
//! chain unless the tail is already on the wire.
//!
//! Durability: the log lives in memory and is written to storage only by
//! [`PendingOperationLog::flush`]. Operations enqueued after the last
//! successful flush are lost if the process dies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use crate::models::{select_fields, Entity, EntityType, Patch};
use crate::session::SessionContext;
use crate::storage::{load_json, save_json, StorageError};

/// Storage key suffix for the persisted log.
const LOG_KEY: &str = "pending_operations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent (possibly in backoff).
    #[default]
    Queued,
    /// Handed to the remote API by the sync engine.
    InFlight,
    /// Retry budget exhausted or rejected outright; parked until retried or discarded.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub kind: OperationKind,
    /// Create: the full tagged entity. Update: a patch object. Delete: null.
    pub payload: Value,
    /// Server version the change was based on; `None` until the entity's
    /// create has been confirmed.
    pub base_version: Option<u64>,
    /// For updates: the values the patched fields had at `base_version`.
    #[serde(default)]
    pub base_fields: Patch,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: OperationStatus,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl PendingOperation {
    fn new(
        entity_type: EntityType,
        entity_id: impl Into<String>,
        kind: OperationKind,
        payload: Value,
        base_version: Option<u64>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            kind,
            payload,
            base_version,
            base_fields: Patch::new(),
            created_at: Utc::now(),
            seq: 0,
            attempt_count: 0,
            next_attempt_at: None,
            status: OperationStatus::Queued,
            last_error: None,
        }
    }

    pub fn create(entity: &Entity) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            entity.entity_type(),
            entity.id(),
            OperationKind::Create,
            serde_json::to_value(entity)?,
            None,
        ))
    }

    /// An update of `patch`, based on `base` (the entity as the server last confirmed it).
    pub fn update(base: &Entity, patch: Patch) -> Result<Self, serde_json::Error> {
        let base_fields = select_fields(&base.fields()?, patch.keys());
        let mut op = Self::new(
            base.entity_type(),
            base.id(),
            OperationKind::Update,
            Value::Object(patch),
            confirmed_version(base),
        );
        op.base_fields = base_fields;
        Ok(op)
    }

    pub fn delete(entity: &Entity) -> Self {
        Self::new(
            entity.entity_type(),
            entity.id(),
            OperationKind::Delete,
            Value::Null,
            confirmed_version(entity),
        )
    }

    pub fn patch(&self) -> Option<&Patch> {
        match (self.kind, &self.payload) {
            (OperationKind::Update, Value::Object(patch)) => Some(patch),
            _ => None,
        }
    }

    /// The entity carried by a create.
    pub fn entity(&self) -> Option<Entity> {
        match self.kind {
            OperationKind::Create => serde_json::from_value(self.payload.clone()).ok(),
            _ => None,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status == OperationStatus::InFlight
    }

    /// Replaces top-level string payload values equal to `from`.
    fn remap_payload(&mut self, from: &str, to: &str) {
        if let Value::Object(fields) = &mut self.payload {
            for value in fields.values_mut() {
                if value.as_str() == Some(from) {
                    *value = Value::String(to.to_string());
                }
            }
        }
    }
}

/// Records never confirmed by the server carry version 0.
fn confirmed_version(entity: &Entity) -> Option<u64> {
    match entity.version() {
        0 => None,
        v => Some(v),
    }
}

/// Retry budget and backoff schedule for failed operations.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` failures.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Appended,
    /// Merged into an existing queued operation.
    Coalesced { into: String },
    /// A delete cancelled an unsent create; nothing will reach the server.
    Cancelled { removed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Parked as a permanent failure.
    Exhausted { attempt: u32 },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedLog {
    next_seq: u64,
    operations: Vec<PendingOperation>,
}

#[derive(Debug, Default)]
pub struct PendingOperationLog {
    ops: Vec<PendingOperation>,
    next_seq: u64,
    policy: RetryPolicy,
    dirty: bool,
}

impl PendingOperationLog {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    /// Loads the last flushed log. Operations that were in flight when the
    /// process stopped are queued again.
    pub async fn load(session: &SessionContext, policy: RetryPolicy) -> Result<Self, StorageError> {
        let persisted: PersistedLog = load_json(session.storage(), &session.key(LOG_KEY))
            .await?
            .unwrap_or_default();

        let mut ops = persisted.operations;
        for op in ops.iter_mut().filter(|op| op.is_in_flight()) {
            op.status = OperationStatus::Queued;
        }
        ops.sort_by_key(|op| op.seq);

        Ok(Self {
            ops,
            next_seq: persisted.next_seq,
            policy,
            dirty: false,
        })
    }

    /// Writes the log to storage if it changed since the last flush.
    pub async fn flush(&mut self, session: &SessionContext) -> Result<(), StorageError> {
        if !self.dirty {
            return Ok(());
        }
        let persisted = PersistedLog {
            next_seq: self.next_seq,
            operations: self.ops.clone(),
        };
        save_json(session.storage(), &session.key(LOG_KEY), &persisted).await?;
        self.dirty = false;
        Ok(())
    }

    pub fn has_unflushed_changes(&self) -> bool {
        self.dirty
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Appends `op`, coalescing or cancelling against the entity's queued chain.
    pub fn enqueue(&mut self, mut op: PendingOperation) -> EnqueueOutcome {
        op.seq = self.next_seq;
        self.next_seq += 1;
        self.dirty = true;

        match op.kind {
            OperationKind::Update => {
                if let Some(tail) = self.waiting_tail_mut(&op.entity_id) {
                    if let Some(into) = coalesce_update(tail, &op) {
                        tracing::debug!(entity_id = %op.entity_id, %into, "coalesced update");
                        return EnqueueOutcome::Coalesced { into };
                    }
                }
            }
            OperationKind::Delete => {
                let unsent_create = self.ops.iter().any(|o| {
                    o.entity_id == op.entity_id
                        && o.kind == OperationKind::Create
                        && !o.is_in_flight()
                });

                let before = self.ops.len();
                self.ops
                    .retain(|o| o.entity_id != op.entity_id || o.is_in_flight());
                let removed = before - self.ops.len();

                if unsent_create {
                    tracing::debug!(entity_id = %op.entity_id, removed, "delete cancelled unsent create");
                    return EnqueueOutcome::Cancelled { removed };
                }
                if removed > 0 {
                    tracing::debug!(entity_id = %op.entity_id, removed, "delete superseded queued updates");
                }
            }
            OperationKind::Create => {}
        }

        tracing::debug!(
            op_id = %op.id,
            entity_id = %op.entity_id,
            kind = ?op.kind,
            "enqueued pending operation"
        );
        self.ops.push(op);
        EnqueueOutcome::Appended
    }

    /// Hands out the oldest sendable operation and marks it in flight.
    ///
    /// Only the head of each entity's chain is eligible, so operations on one
    /// entity leave strictly in order. Entities in `skip` are passed over, as
    /// are heads that are in flight, parked, or still backing off.
    pub fn dequeue_next(
        &mut self,
        now: DateTime<Utc>,
        skip: &HashSet<String>,
    ) -> Option<PendingOperation> {
        let chosen = {
            let mut seen: HashSet<&str> = HashSet::new();
            self.ops.iter().position(|op| {
                if !seen.insert(op.entity_id.as_str()) {
                    return false;
                }
                op.status == OperationStatus::Queued
                    && !skip.contains(&op.entity_id)
                    && !matches!(op.next_attempt_at, Some(at) if at > now)
            })
        };

        let op = &mut self.ops[chosen?];
        op.status = OperationStatus::InFlight;
        self.dirty = true;
        Some(op.clone())
    }

    /// Removes an operation after the server confirmed it.
    pub fn ack(&mut self, op_id: &str) -> Option<PendingOperation> {
        self.remove(op_id)
    }

    /// Records a failed attempt, scheduling a retry or parking the operation.
    pub fn fail(
        &mut self,
        op_id: &str,
        retryable: bool,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<FailOutcome> {
        let policy = self.policy.clone();
        let op = self.ops.iter_mut().find(|o| o.id == op_id)?;

        op.attempt_count += 1;
        op.last_error = Some(error.into());
        self.dirty = true;

        if retryable && op.attempt_count < policy.max_attempts {
            let delay = chrono::Duration::from_std(policy.backoff(op.attempt_count))
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
            let next_attempt_at = now + delay;
            op.status = OperationStatus::Queued;
            op.next_attempt_at = Some(next_attempt_at);
            tracing::warn!(
                op_id,
                attempt = op.attempt_count,
                %next_attempt_at,
                error = op.last_error.as_deref().unwrap_or(""),
                "operation failed; will retry"
            );
            Some(FailOutcome::Retrying {
                attempt: op.attempt_count,
                next_attempt_at,
            })
        } else {
            op.status = OperationStatus::Failed;
            op.next_attempt_at = None;
            tracing::warn!(
                op_id,
                attempt = op.attempt_count,
                error = op.last_error.as_deref().unwrap_or(""),
                "operation failed permanently"
            );
            Some(FailOutcome::Exhausted {
                attempt: op.attempt_count,
            })
        }
    }

    /// Returns an in-flight operation to the queue without counting an attempt.
    pub fn release(&mut self, op_id: &str) {
        if let Some(op) = self.ops.iter_mut().find(|o| o.id == op_id && o.is_in_flight()) {
            op.status = OperationStatus::Queued;
            self.dirty = true;
        }
    }

    pub fn remove(&mut self, op_id: &str) -> Option<PendingOperation> {
        let pos = self.ops.iter().position(|o| o.id == op_id)?;
        self.dirty = true;
        Some(self.ops.remove(pos))
    }

    /// Re-arms a parked operation with a fresh retry budget.
    pub fn retry_failed(&mut self, op_id: &str) -> bool {
        match self
            .ops
            .iter_mut()
            .find(|o| o.id == op_id && o.status == OperationStatus::Failed)
        {
            Some(op) => {
                op.status = OperationStatus::Queued;
                op.attempt_count = 0;
                op.next_attempt_at = None;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Drops a parked operation for good.
    pub fn discard(&mut self, op_id: &str) -> Option<PendingOperation> {
        let is_failed = self
            .ops
            .iter()
            .any(|o| o.id == op_id && o.status == OperationStatus::Failed);
        if is_failed {
            self.remove(op_id)
        } else {
            None
        }
    }

    /// Total operations not yet confirmed, parked ones included.
    pub fn count(&self) -> usize {
        self.ops.len()
    }

    pub fn count_for(&self, entity_type: EntityType) -> usize {
        self.ops
            .iter()
            .filter(|o| o.entity_type == entity_type)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn operations(&self) -> &[PendingOperation] {
        &self.ops
    }

    pub fn failed_operations(&self) -> Vec<PendingOperation> {
        self.ops
            .iter()
            .filter(|o| o.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    pub fn get(&self, op_id: &str) -> Option<&PendingOperation> {
        self.ops.iter().find(|o| o.id == op_id)
    }

    pub fn for_entity<'a>(
        &'a self,
        entity_id: &'a str,
    ) -> impl Iterator<Item = &'a PendingOperation> + 'a {
        self.ops.iter().filter(move |o| o.entity_id == entity_id)
    }

    pub fn has_pending(&self, entity_id: &str) -> bool {
        self.for_entity(entity_id).next().is_some()
    }

    /// Points every operation on `from` at the server id `to`, and rewrites
    /// payload references to `from`. Operations that were waiting for the
    /// create to be confirmed become based on `server_version`.
    pub fn remap_entity(&mut self, from: &str, to: &str, server_version: u64) {
        for op in self.ops.iter_mut() {
            if op.entity_id == from {
                op.entity_id = to.to_string();
                if op.base_version.is_none() {
                    op.base_version = Some(server_version);
                }
                self.dirty = true;
            }
            let before = op.payload.clone();
            op.remap_payload(from, to);
            if op.payload != before {
                self.dirty = true;
            }
        }
    }

    /// Re-bases the entity's waiting operations on a newer server version.
    pub fn rebase(&mut self, entity_id: &str, server_version: u64, server_fields: &Patch) {
        for op in self
            .ops
            .iter_mut()
            .filter(|o| o.entity_id == entity_id && !o.is_in_flight())
        {
            op.base_version = Some(server_version);
            let base_fields = op
                .patch()
                .map(|patch| select_fields(server_fields, patch.keys()));
            if let Some(base_fields) = base_fields {
                op.base_fields = base_fields;
            }
            self.dirty = true;
        }
    }

    /// The last operation on `entity_id` that is not on the wire.
    fn waiting_tail_mut(&mut self, entity_id: &str) -> Option<&mut PendingOperation> {
        self.ops
            .iter_mut()
            .rev()
            .find(|o| o.entity_id == entity_id)
            .filter(|o| !o.is_in_flight())
    }
}

/// Folds an update into `tail`. Returns the id of the operation merged into.
fn coalesce_update(tail: &mut PendingOperation, update: &PendingOperation) -> Option<String> {
    let Value::Object(new_fields) = &update.payload else {
        return None;
    };

    match (tail.kind, &mut tail.payload) {
        (OperationKind::Update, Value::Object(patch)) => {
            for (key, value) in new_fields {
                if !patch.contains_key(key) {
                    if let Some(base) = update.base_fields.get(key) {
                        tail.base_fields.insert(key.clone(), base.clone());
                    }
                }
                patch.insert(key.clone(), value.clone());
            }
        }
        (OperationKind::Create, Value::Object(entity)) => {
            for (key, value) in new_fields {
                entity.insert(key.clone(), value.clone());
            }
        }
        _ => return None,
    }

    tail.attempt_count = 0;
    tail.next_attempt_at = None;
    tail.status = OperationStatus::Queued;
    tail.last_error = None;
    Some(tail.id.clone())
}
