//! Change notifications published by the cache.
//!
//! Any number of subscribers (the hooks facade, tests, a UI bridge) can
//! attach; delivery is best-effort and a lagging subscriber only misses
//! events, it never blocks the publisher.

use tokio::sync::broadcast;

use crate::models::EntityType;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Upserted {
        entity_type: EntityType,
        id: String,
    },
    Removed {
        entity_type: EntityType,
        id: String,
    },
    /// A locally assigned id was replaced by the server's id.
    Remapped {
        entity_type: EntityType,
        from: String,
        to: String,
    },
    PendingChanged {
        count: usize,
    },
    ConflictsChanged {
        count: usize,
    },
    SyncStarted,
    SyncFinished {
        success: bool,
    },
    /// A write to persistent storage failed; the in-memory change stands.
    StorageFailed {
        message: String,
    },
    /// A later success cleared the recorded failure.
    ErrorCleared,
}

impl CacheEvent {
    /// The entity type this event concerns, if any.
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            CacheEvent::Upserted { entity_type, .. }
            | CacheEvent::Removed { entity_type, .. }
            | CacheEvent::Remapped { entity_type, .. } => Some(*entity_type),
            _ => None,
        }
    }
}

/// Publish side of the event channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: CacheEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(CacheEvent::SyncStarted);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(CacheEvent::PendingChanged { count: 3 });

        assert_eq!(
            first.recv().await.unwrap(),
            CacheEvent::PendingChanged { count: 3 }
        );
        assert_eq!(
            second.recv().await.unwrap(),
            CacheEvent::PendingChanged { count: 3 }
        );
    }

    #[test]
    fn test_event_entity_type() {
        let event = CacheEvent::Removed {
            entity_type: EntityType::Recipe,
            id: "r1".into(),
        };
        assert_eq!(event.entity_type(), Some(EntityType::Recipe));
        assert_eq!(CacheEvent::SyncStarted.entity_type(), None);
    }
}
