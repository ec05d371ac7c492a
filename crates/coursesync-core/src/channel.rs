//! Cross-context change notification.
//!
//! Contexts never message each other directly. A writer bumps the marker
//! key in the shared store; every other context sharing that store gets a
//! `ChangeNotification` and re-reads the store itself.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::models::LogicalTimestamp;
use crate::store::{ContextId, StorageEvent, StorageScope, MARKER_KEY};

/// Notifications buffered for the consuming engine.
const NOTIFICATION_BUFFER_SIZE: usize = 32;

/// Signal that the shared store changed; carries no payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub key: String,
    pub new_value: LogicalTimestamp,
}

impl ChangeNotification {
    fn from_marker(raw: &str) -> Self {
        Self {
            key: MARKER_KEY.to_string(),
            new_value: LogicalTimestamp::parse(raw).unwrap_or(LogicalTimestamp::EPOCH),
        }
    }
}

#[derive(Clone)]
pub struct CrossContextChannel {
    context: ContextId,
    scope: StorageScope,
    // Last marker value written or delivered here; suppresses echoes
    last_seen: Arc<Mutex<Option<String>>>,
}

impl CrossContextChannel {
    pub fn new(scope: StorageScope, context: ContextId) -> Self {
        let current = scope.get(MARKER_KEY).unwrap_or_else(|e| {
            warn!(error = %e, "Failed to read write marker");
            None
        });
        Self {
            context,
            scope,
            last_seen: Arc::new(Mutex::new(current)),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    fn last_seen(&self) -> MutexGuard<'_, Option<String>> {
        self.last_seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Bump the marker so every other context reconciles.
    pub fn publish(&self, timestamp: LogicalTimestamp) -> Result<(), SyncError> {
        let value = timestamp.to_string();
        *self.last_seen() = Some(value.clone());
        self.scope.set(self.context, MARKER_KEY, &value)
    }

    /// Returns `Some` for marker writes by other contexts not yet delivered.
    fn accept(&self, event: &StorageEvent) -> Option<ChangeNotification> {
        if event.key != MARKER_KEY || event.origin == self.context {
            return None;
        }
        let value = event.new_value.as_deref()?;
        let mut last_seen = self.last_seen();
        if last_seen.as_deref() == Some(value) {
            return None;
        }
        *last_seen = Some(value.to_string());
        Some(ChangeNotification::from_marker(value))
    }

    /// Read the marker directly; catches writers in other processes.
    fn poll_marker(&self) -> Option<ChangeNotification> {
        let value = match self.scope.get(MARKER_KEY) {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(e) => {
                debug!(error = %e, "Failed to poll write marker");
                return None;
            }
        };
        let mut last_seen = self.last_seen();
        if last_seen.as_deref() == Some(value.as_str()) {
            return None;
        }
        let notification = ChangeNotification::from_marker(&value);
        *last_seen = Some(value);
        Some(notification)
    }

    /// Start delivering notifications for this context.
    ///
    /// The task ends once the returned receiver is dropped and the next
    /// notification cannot be delivered.
    pub fn listen(
        &self,
        poll_interval: Option<Duration>,
    ) -> (mpsc::Receiver<ChangeNotification>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER_SIZE);
        let channel = self.clone();
        let mut events = self.scope.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = poll_interval.map(tokio::time::interval);
            loop {
                let notification = tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => channel.accept(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Storage events lagged, re-reading marker");
                            channel.poll_marker()
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = async {
                        match ticker.as_mut() {
                            Some(ticker) => { ticker.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => channel.poll_marker(),
                };

                if let Some(notification) = notification {
                    if tx.send(notification).await.is_err() {
                        break;
                    }
                }
            }
            debug!(context = %channel.context, "Change listener stopped");
        });

        (rx, handle)
    }
}
