//! Store change notifications.
//!
//! The registry publishes a [`StoreEvent`] after every successful content
//! write/delete and every group membership update. Anything that caches data
//! derived from store content subscribes here.

use tokio::sync::broadcast;

use crate::group::GroupDefinition;
use crate::key::StoreKey;
use crate::path::ContentPath;

/// Default number of events buffered per subscriber before it starts lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Content at `path` in `store` was written or deleted.
    ContentChanged { store: StoreKey, path: ContentPath },
    /// A group was created, had its constituents added/removed/reordered, or
    /// was deleted (in which case `group` is the last known definition).
    MembershipChanged { group: GroupDefinition },
}
impl StoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContentChanged { .. } => "content_changed",
            Self::MembershipChanged { .. } => "membership_changed",
        }
    }
}

/// Broadcast channel distributing [`StoreEvent`]s to every subscriber.
///
/// Delivery is at-least-once per subscriber as long as the subscriber keeps
/// up; a subscriber that falls more than the channel capacity behind receives
/// [`RecvError::Lagged`](broadcast::error::RecvError::Lagged) and must assume
/// it missed arbitrary events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StoreEvent>,
}
impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never blocks; with no subscribers the event is dropped.
    pub fn publish(&self, event: StoreEvent) {
        let kind = event.kind();
        match self.tx.send(event) {
            Ok(receivers) => tracing::debug!(event = kind, receivers, "Published store event"),
            Err(_) => tracing::debug!(event = kind, "No subscribers for store event"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.tx.subscribe()
    }
}
impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let event = StoreEvent::ContentChanged {
            store: StoreKey::hosted("local"),
            path: ContentPath::parse("a.pom").unwrap(),
        };
        bus.publish(event.clone());
        assert_eq!(first.recv().await.unwrap(), event);
        assert_eq!(second.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(1);
        bus.publish(StoreEvent::ContentChanged {
            store: StoreKey::hosted("local"),
            path: ContentPath::parse("a.pom").unwrap(),
        });
    }
}
