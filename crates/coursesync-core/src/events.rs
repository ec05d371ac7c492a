//! Typed events exposed to the UI layer and consumed from the platform.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::models::Snapshot;

/// Events buffered per UI subscriber.
const EVENT_BUFFER_SIZE: usize = 64;

/// Which tier produced newly installed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Server,
    /// A cached copy of an earlier server response, read while offline.
    OfflineCache,
    LocalStore,
    Defaults,
    /// A write made in this context.
    LocalWrite,
    /// A write made by another context sharing the store.
    OtherContext,
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The visible collections changed.
    DataUpdated {
        source: UpdateSource,
        snapshot: Arc<Snapshot>,
    },
    /// A user-initiated resync finished; drives a transient indicator.
    ForceSyncFinished { success: bool },
}

/// Platform notifications that should trigger a resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformSignal {
    VisibilityRegained,
    ConnectivityRestored,
}

/// Subscriber list for `SyncEvent`s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        if self.sender.send(event).is_err() {
            trace!("No sync event subscribers");
        }
    }

    pub fn data_updated(&self, source: UpdateSource, snapshot: Arc<Snapshot>) {
        self.emit(SyncEvent::DataUpdated { source, snapshot });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
