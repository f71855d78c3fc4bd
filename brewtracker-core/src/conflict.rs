//! Conflict detection and the set of unresolved conflicts.
//!
//! A pending operation records the server version it was based on. When the
//! server reports a different version, [`ConflictDetector::check`] decides
//! whether the local change still applies cleanly or has to be surfaced as a
//! [`Conflict`]. Conflicts are never resolved implicitly; they stay in the
//! [`ConflictSet`] until a caller picks a [`Resolution`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ValidationError;
use crate::models::{select_fields, Entity, EntityType, Patch};
use crate::oplog::{OperationKind, PendingOperation};
use crate::session::SessionContext;
use crate::storage::{load_json, save_json, StorageError};

const CONFLICTS_KEY: &str = "conflicts";

/// Result of checking a pending operation against the server's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The server has not moved in a way that matters; send the change.
    Applied,
    /// The server is newer but the local change still makes sense as is
    /// (a delete of a record that changed, or is already gone).
    Superseded,
    /// Both sides changed the same data.
    Conflict,
}

pub struct ConflictDetector;

impl ConflictDetector {
    /// Classifies `op` against the server's current copy (`None` if the
    /// server no longer has the record).
    pub fn check(op: &PendingOperation, server: Option<&Entity>) -> Outcome {
        match op.kind {
            OperationKind::Create => Outcome::Applied,
            OperationKind::Delete => match server {
                Some(server) if Some(server.version()) == op.base_version => Outcome::Applied,
                _ => Outcome::Superseded,
            },
            OperationKind::Update => {
                let Some(server) = server else {
                    return Outcome::Conflict;
                };
                if op.base_version.is_none() || Some(server.version()) == op.base_version {
                    return Outcome::Applied;
                }
                let (Some(patch), Ok(server_fields)) = (op.patch(), server.fields()) else {
                    return Outcome::Conflict;
                };

                let current = select_fields(&server_fields, patch.keys());
                if current == op.base_fields || &current == patch {
                    // The server only touched fields this change leaves alone,
                    // or it already holds the same values.
                    Outcome::Applied
                } else {
                    Outcome::Conflict
                }
            }
        }
    }
}

/// A local change that diverged from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub entity_type: EntityType,
    pub entity_id: String,
    /// The record as this device currently shows it.
    pub local_snapshot: Entity,
    /// The server's record; `None` if it was deleted on the server.
    pub server_snapshot: Option<Entity>,
    /// Every field changed locally since the last confirmed version.
    pub local_patch: Patch,
    pub base_version: Option<u64>,
    pub detected_at: DateTime<Utc>,
}

impl Conflict {
    pub fn new(
        local_snapshot: Entity,
        server_snapshot: Option<Entity>,
        local_patch: Patch,
        base_version: Option<u64>,
    ) -> Self {
        Self {
            entity_type: local_snapshot.entity_type(),
            entity_id: local_snapshot.id().to_string(),
            local_snapshot,
            server_snapshot,
            local_patch,
            base_version,
            detected_at: Utc::now(),
        }
    }

    pub fn server_deleted(&self) -> bool {
        self.server_snapshot.is_none()
    }

    /// Locally changed fields whose server value differs from the local one.
    pub fn conflicting_fields(&self) -> Vec<String> {
        let server_fields = self
            .server_snapshot
            .as_ref()
            .and_then(|s| s.fields().ok())
            .unwrap_or_default();
        self.local_patch
            .iter()
            .filter(|(key, value)| server_fields.get(*key) != Some(value))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Works out the store write and the operation (if any) that settle this
    /// conflict.
    pub fn plan(&self, resolution: &Resolution) -> Result<ResolutionPlan, ValidationError> {
        let plan = match (resolution, &self.server_snapshot) {
            (Resolution::KeepServer, Some(server)) => ResolutionPlan {
                store: StoreAction::Put(server.clone()),
                operation: None,
            },
            (Resolution::KeepServer, None) => ResolutionPlan {
                store: StoreAction::Remove,
                operation: None,
            },
            (Resolution::KeepLocal, Some(server)) => {
                update_plan(server, self.local_patch.clone())?
            }
            (Resolution::Merge(patch), Some(server)) => update_plan(server, patch.clone())?,
            (Resolution::KeepLocal, None) => recreate_plan(self.local_snapshot.clone())?,
            (Resolution::Merge(patch), None) => {
                recreate_plan(self.local_snapshot.apply_patch(patch)?)?
            }
        };
        Ok(plan)
    }
}

fn update_plan(server: &Entity, patch: Patch) -> Result<ResolutionPlan, ValidationError> {
    if patch.is_empty() {
        return Ok(ResolutionPlan {
            store: StoreAction::Put(server.clone()),
            operation: None,
        });
    }
    let mut merged = server.apply_patch(&patch)?;
    merged.validate()?;
    merged.touch();
    let op = PendingOperation::update(server, patch)
        .map_err(|e| ValidationError::InvalidPatch(e.to_string()))?;
    Ok(ResolutionPlan {
        store: StoreAction::Put(merged),
        operation: Some(op),
    })
}

/// The server deleted the record; send it again as a new create.
fn recreate_plan(mut entity: Entity) -> Result<ResolutionPlan, ValidationError> {
    entity.validate()?;
    entity.set_version(0);
    entity.touch();
    let op = PendingOperation::create(&entity)
        .map_err(|e| ValidationError::InvalidPatch(e.to_string()))?;
    Ok(ResolutionPlan {
        store: StoreAction::Put(entity),
        operation: Some(op),
    })
}

/// How the user (or a policy) settles a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Re-send the local change on top of the server's version.
    KeepLocal,
    /// Throw the local change away.
    KeepServer,
    /// Apply a hand-merged patch on top of the server's version.
    Merge(Patch),
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreAction {
    Put(Entity),
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionPlan {
    pub store: StoreAction,
    pub operation: Option<PendingOperation>,
}

/// Default resolution applied by `resolve_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Leave every conflict for the user.
    #[default]
    Manual,
    PreferServer,
    PreferLocal,
}

impl ConflictPolicy {
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            ConflictPolicy::Manual => None,
            ConflictPolicy::PreferServer => Some(Resolution::KeepServer),
            ConflictPolicy::PreferLocal => Some(Resolution::KeepLocal),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::Manual => "manual",
            ConflictPolicy::PreferServer => "prefer_server",
            ConflictPolicy::PreferLocal => "prefer_local",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "manual" => Ok(ConflictPolicy::Manual),
            "prefer_server" | "server" => Ok(ConflictPolicy::PreferServer),
            "prefer_local" | "local" => Ok(ConflictPolicy::PreferLocal),
            other => Err(format!("unknown conflict policy: {}", other)),
        }
    }
}

/// Unresolved conflicts, at most one per entity, persisted under
/// `user:<id>:conflicts`.
#[derive(Debug, Default)]
pub struct ConflictSet {
    conflicts: BTreeMap<String, Conflict>,
    dirty: bool,
}

impl ConflictSet {
    pub async fn load(session: &SessionContext) -> Result<Self, StorageError> {
        let conflicts = load_json(session.storage(), &session.key(CONFLICTS_KEY))
            .await?
            .unwrap_or_default();
        Ok(Self {
            conflicts,
            dirty: false,
        })
    }

    pub async fn flush(&mut self, session: &SessionContext) -> Result<(), StorageError> {
        if self.dirty {
            save_json(session.storage(), &session.key(CONFLICTS_KEY), &self.conflicts).await?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Records a conflict. A second conflict on the same entity keeps the
    /// original detection time and accumulates the local patch.
    pub fn insert(&mut self, mut conflict: Conflict) {
        tracing::warn!(
            entity_type = %conflict.entity_type,
            entity_id = %conflict.entity_id,
            server_deleted = conflict.server_deleted(),
            "conflict detected"
        );
        if let Some(existing) = self.conflicts.remove(&conflict.entity_id) {
            let mut patch = existing.local_patch;
            patch.extend(conflict.local_patch);
            conflict.local_patch = patch;
            conflict.detected_at = existing.detected_at;
        }
        self.conflicts.insert(conflict.entity_id.clone(), conflict);
        self.dirty = true;
    }

    pub fn get(&self, entity_id: &str) -> Option<&Conflict> {
        self.conflicts.get(entity_id)
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.conflicts.contains_key(entity_id)
    }

    pub fn remove(&mut self, entity_id: &str) -> Option<Conflict> {
        let removed = self.conflicts.remove(entity_id);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Folds a local edit made while the conflict is open into its local side.
    pub fn amend_local(&mut self, local: Entity, patch: &Patch) -> bool {
        match self.conflicts.get_mut(local.id()) {
            Some(conflict) => {
                conflict
                    .local_patch
                    .extend(patch.iter().map(|(k, v)| (k.clone(), v.clone())));
                conflict.local_snapshot = local;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Replaces the server side of an open conflict with a newer pulled
    /// copy (`None` once the server deleted the record).
    pub fn refresh_server(&mut self, entity_id: &str, server: Option<Entity>) {
        let Some(conflict) = self.conflicts.get_mut(entity_id) else {
            return;
        };
        let newer = match (&conflict.server_snapshot, &server) {
            (Some(old), Some(new)) => new.version() > old.version(),
            (None, None) => false,
            _ => true,
        };
        if newer {
            conflict.server_snapshot = server;
            self.dirty = true;
        }
    }

    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn count_for(&self, entity_type: EntityType) -> usize {
        self.conflicts
            .values()
            .filter(|c| c.entity_type == entity_type)
            .count()
    }

    /// Oldest first.
    pub fn list(&self) -> Vec<Conflict> {
        let mut conflicts: Vec<Conflict> = self.conflicts.values().cloned().collect();
        conflicts.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        conflicts
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &String> {
        self.conflicts.keys()
    }

    /// Follows a local id to its server id.
    pub fn remap(&mut self, from: &str, to: &str) {
        if let Some(mut conflict) = self.conflicts.remove(from) {
            conflict.entity_id = to.to_string();
            conflict.local_snapshot.set_id(to.to_string());
            self.conflicts.insert(to.to_string(), conflict);
            self.dirty = true;
        }
        for conflict in self.conflicts.values_mut() {
            if conflict.local_snapshot.remap_reference(from, to) {
                self.dirty = true;
            }
        }
    }
}
