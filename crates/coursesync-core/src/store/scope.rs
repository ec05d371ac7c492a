use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use super::LocalStore;
use crate::error::SyncError;

/// Storage events buffered per subscriber before it starts lagging.
const EVENT_BUFFER_SIZE: usize = 64;

/// Identifies one context (tab, window, process) sharing a storage scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub fn random() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A write observed through the scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

/// Shared handle to one client's store.
///
/// Every context of a client holds a clone. Writes go to the backend first
/// and are then broadcast, so a subscriber that reacts by reading the store
/// always sees the committed value.
#[derive(Clone)]
pub struct StorageScope {
    backend: Arc<dyn LocalStore>,
    events: broadcast::Sender<StorageEvent>,
}

impl StorageScope {
    pub fn new(backend: Arc<dyn LocalStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { backend, events }
    }

    pub fn backend(&self) -> &Arc<dyn LocalStore> {
        &self.backend
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        self.backend.get(key)
    }

    pub fn set(&self, origin: ContextId, key: &str, value: &str) -> Result<(), SyncError> {
        self.backend.set(key, value)?;
        self.notify(origin, key, Some(value.to_string()));
        Ok(())
    }

    pub fn remove(&self, origin: ContextId, key: &str) -> Result<(), SyncError> {
        self.backend.remove(key)?;
        self.notify(origin, key, None);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    fn notify(&self, origin: ContextId, key: &str, new_value: Option<String>) {
        let event = StorageEvent {
            key: key.to_string(),
            new_value,
            origin,
        };
        // No receivers just means no other context is open
        if self.events.send(event).is_err() {
            trace!(key, "No storage subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_set_broadcasts_after_commit() {
        let scope = StorageScope::new(Arc::new(MemoryStore::new()));
        let mut rx = scope.subscribe();
        let writer = ContextId::random();

        scope.set(writer, "dataUpdated", "42").expect("set");

        let event = rx.recv().await.expect("event");
        assert_eq!(event.key, "dataUpdated");
        assert_eq!(event.new_value.as_deref(), Some("42"));
        assert_eq!(event.origin, writer);
        assert_eq!(scope.get("dataUpdated").expect("get").as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_failed_write_is_not_broadcast() {
        let scope = StorageScope::new(Arc::new(MemoryStore::with_quota(4)));
        let mut rx = scope.subscribe();

        assert!(scope.set(ContextId::random(), "dataUpdated", "123456").is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_context_ids_differ() {
        assert_ne!(ContextId::random(), ContextId::random());
    }
}
