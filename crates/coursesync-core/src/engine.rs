//! Reconciliation between the server and this context's collections.
//!
//! Sync is best-effort: no read or write failure is ever raised to the UI.
//! A failed server read falls back one tier (local store, then defaults), a
//! failed server write leaves the local write in place until the next
//! successful read overwrites it. Writes are never queued for retry.
//!
//! A read the offline cache answered is a fallback too. It may fill in data
//! the local store lacks but never outranks a newer local write, and it
//! never counts as a successful sync.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::api::{ApiClient, FetchedSnapshot};
use crate::channel::{ChangeNotification, CrossContextChannel};
use crate::collections::CollectionStore;
use crate::error::SyncError;
use crate::events::{EventBus, PlatformSignal, SyncEvent, UpdateSource};
use crate::models::{CollectionName, LogicalTimestamp, Record, Snapshot};
use crate::store::{ContextId, StorageScope};

/// Default polling period.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Platform signals buffered per subscriber.
const SIGNAL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Loading,
    Synced,
}

/// Tier that served a read when the server could not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTier {
    /// The offline cache's copy of an earlier server response.
    OfflineCache,
    LocalStore,
    Defaults,
    /// Nothing better was available; the view is unchanged.
    InMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// A server snapshot was installed.
    Updated,
    /// The server matched what is already held.
    Unchanged,
    /// The held snapshot is newer than the server's.
    KeptLocal,
    /// The server was unreachable, sent garbage, or only the offline cache
    /// answered.
    Fallback(FallbackTier),
}

impl LoadOutcome {
    pub fn reached_server(&self) -> bool {
        !matches!(self, LoadOutcome::Fallback(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropagateOutcome {
    pub timestamp: LogicalTimestamp,
    /// False when the local store rejected the write.
    pub persisted: bool,
    pub server_acknowledged: bool,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub sync_interval: Duration,
    /// Also poll the write marker, for contexts in other processes.
    pub marker_poll_interval: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            marker_poll_interval: None,
        }
    }
}

/// Keeps the state `Loading` while any load is in flight.
struct LoadGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.engine.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.engine.state.send_replace(SyncState::Synced);
        }
    }
}

pub struct SyncEngine {
    api: ApiClient,
    collections: Arc<CollectionStore>,
    channel: CrossContextChannel,
    events: EventBus,
    settings: EngineSettings,
    // Timestamp of the last server snapshot seen; EPOCH forces the next install
    watermark: Mutex<LogicalTimestamp>,
    // Whether the last load reached the server; None before the first load
    reachable: Mutex<Option<bool>>,
    signals: broadcast::Sender<PlatformSignal>,
    in_flight: AtomicUsize,
    state: watch::Sender<SyncState>,
}

impl SyncEngine {
    pub fn new(
        api: ApiClient,
        scope: StorageScope,
        context: ContextId,
        events: EventBus,
        settings: EngineSettings,
    ) -> Self {
        let collections = Arc::new(CollectionStore::new(scope.clone(), context));
        let channel = CrossContextChannel::new(scope, context);
        let (state, _) = watch::channel(SyncState::Idle);
        let (signals, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self {
            api,
            collections,
            channel,
            events,
            settings,
            watermark: Mutex::new(LogicalTimestamp::EPOCH),
            reachable: Mutex::new(None),
            signals,
            in_flight: AtomicUsize::new(0),
            state,
        }
    }

    pub fn context(&self) -> ContextId {
        self.channel.context()
    }

    pub fn collections(&self) -> &Arc<CollectionStore> {
        &self.collections
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.collections.current()
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    /// Sender for visibility and connectivity signals. The engine itself
    /// sends `ConnectivityRestored` when a load reaches the server after one
    /// that did not.
    pub fn signal_sender(&self) -> broadcast::Sender<PlatformSignal> {
        self.signals.clone()
    }

    pub fn subscribe_signals(&self) -> broadcast::Receiver<PlatformSignal> {
        self.signals.subscribe()
    }

    fn watermark(&self) -> MutexGuard<'_, LogicalTimestamp> {
        self.watermark.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn begin_load(&self) -> LoadGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.state.send_replace(SyncState::Loading);
        LoadGuard { engine: self }
    }

    /// Run the fallback chain once: server, then local store, then defaults.
    pub async fn initial_load(&self) -> LoadOutcome {
        let outcome = self.load_from_server().await;
        info!(?outcome, context = %self.context(), "Initial load complete");
        outcome
    }

    /// Fetch the server snapshot and install it if it is different or newer.
    pub async fn load_from_server(&self) -> LoadOutcome {
        let _guard = self.begin_load();
        let outcome = match self.api.fetch_snapshot().await {
            Ok(FetchedSnapshot {
                snapshot,
                from_cache: false,
            }) => self.reconcile(snapshot),
            Ok(FetchedSnapshot { snapshot, .. }) => {
                warn!("Server unreachable, offline cache answered");
                LoadOutcome::Fallback(self.load_from_offline_cache(snapshot))
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, "Failed to sync with server, using local data");
                } else {
                    error!(error = %e, "Server rejected the read, using local data");
                }
                LoadOutcome::Fallback(self.load_from_local())
            }
        };
        self.note_reachability(outcome.reached_server());
        outcome
    }

    fn note_reachability(&self, reached: bool) {
        let previous = {
            let mut reachable = self.reachable.lock().unwrap_or_else(|p| p.into_inner());
            reachable.replace(reached)
        };
        if reached && previous == Some(false) {
            info!(context = %self.context(), "Server reachable again");
            // No listener is fine
            let _ = self.signals.send(PlatformSignal::ConnectivityRestored);
        }
    }

    fn reconcile(&self, server: Snapshot) -> LoadOutcome {
        let held = self.collections.current();
        let server_time = server.last_sync_time;
        let forced = self.watermark().is_epoch();

        if held.last_sync_time > server_time {
            debug!(local = %held.last_sync_time, server = %server_time, "Local snapshot is newer, keeping it");
            return LoadOutcome::KeptLocal;
        }

        if !forced && held.same_content(&server) {
            self.advance_watermark(server_time);
            return LoadOutcome::Unchanged;
        }

        let install = self.collections.apply_snapshot(server);
        if !install.applied {
            // A newer snapshot landed while this read was in flight
            return LoadOutcome::KeptLocal;
        }
        self.advance_watermark(server_time);

        if install.changed || forced {
            debug!(%server_time, changed = install.changed, "Installed server snapshot");
            self.events.data_updated(UpdateSource::Server, install.snapshot);
        }
        if install.changed {
            LoadOutcome::Updated
        } else {
            LoadOutcome::Unchanged
        }
    }

    fn advance_watermark(&self, seen: LogicalTimestamp) {
        let mut watermark = self.watermark();
        *watermark = (*watermark).max(seen);
    }

    /// Second and third tiers of the fallback chain.
    pub fn load_from_local(&self) -> FallbackTier {
        if self.install_local() {
            return FallbackTier::LocalStore;
        }
        self.install_defaults()
    }

    /// Install the stored snapshot if it is newer; false when there is none.
    fn install_local(&self) -> bool {
        match self.collections.install_from_local() {
            Ok(Some(install)) => {
                if install.changed {
                    self.events
                        .data_updated(UpdateSource::LocalStore, install.snapshot);
                }
                true
            }
            Ok(None) => {
                debug!("Local store is empty");
                false
            }
            Err(e) => {
                warn!(error = %e, "Local store unavailable");
                false
            }
        }
    }

    /// The local store goes first; the cached copy is installed only when
    /// it is at least as new as what that leaves in memory. The watermark
    /// is left alone, so the next real read is judged as before.
    fn load_from_offline_cache(&self, cached: Snapshot) -> FallbackTier {
        let had_local = self.install_local();
        let not_cached = if had_local {
            FallbackTier::LocalStore
        } else {
            FallbackTier::InMemory
        };

        let held = self.collections.current();
        if cached.last_sync_time < held.last_sync_time {
            debug!(local = %held.last_sync_time, cached = %cached.last_sync_time, "Local snapshot is newer than the cached response");
            return not_cached;
        }
        if held.same_content(&cached) {
            return FallbackTier::OfflineCache;
        }

        let install = self.collections.apply_snapshot(cached);
        if !install.applied {
            return not_cached;
        }
        if install.changed {
            self.events
                .data_updated(UpdateSource::OfflineCache, install.snapshot);
        }
        FallbackTier::OfflineCache
    }

    fn install_defaults(&self) -> FallbackTier {
        let install = self.collections.load_defaults();
        if !install.applied {
            return FallbackTier::InMemory;
        }
        if install.changed {
            info!("No server or cached data, using built-in defaults");
            self.events.data_updated(UpdateSource::Defaults, install.snapshot);
        }
        FallbackTier::Defaults
    }

    /// Write one collection: locally first, then to the server, then tell
    /// the other contexts.
    ///
    /// Only invalid records (duplicate ids) are reported as an error; store
    /// and server failures are logged and reflected in the outcome.
    pub async fn propagate(
        &self,
        name: CollectionName,
        records: Vec<Record>,
    ) -> Result<PropagateOutcome, SyncError> {
        let timestamp = self.collections.last_sync_time().next_after();

        let persisted = match self.collections.replace(name, records.clone(), timestamp) {
            Ok(snapshot) => {
                self.events.data_updated(UpdateSource::LocalWrite, snapshot);
                true
            }
            Err(SyncError::StoreUnavailable(reason)) => {
                warn!(collection = %name, %reason, "Local write lost, store unavailable");
                false
            }
            Err(e) => return Err(e),
        };

        let snapshot = self.collections.current();
        match self.api.mirror_payload(&snapshot.collections).await {
            Ok(true) => debug!("Legacy mirror updated"),
            Ok(false) => {}
            Err(e) => debug!(error = %e, "Legacy mirror failed, ignoring"),
        }

        let server_acknowledged = match self.api.put_collection(name, &records).await {
            Ok(()) => {
                info!(collection = %name, count = records.len(), "Server write succeeded");
                true
            }
            Err(e) => {
                warn!(collection = %name, error = %e, "Server update failed, using local sync only");
                false
            }
        };

        if let Err(e) = self.channel.publish(timestamp) {
            warn!(error = %e, "Failed to notify other contexts");
        }

        Ok(PropagateOutcome {
            timestamp,
            persisted,
            server_acknowledged,
        })
    }

    /// Treat any server snapshot as newer and reload now.
    pub async fn force_sync(&self) -> LoadOutcome {
        info!(context = %self.context(), "Forcing sync");
        *self.watermark() = LogicalTimestamp::EPOCH;
        let outcome = self.load_from_server().await;
        self.events.emit(SyncEvent::ForceSyncFinished {
            success: outcome.reached_server(),
        });
        outcome
    }

    /// Forget the in-memory view and rerun the fallback chain.
    pub async fn reload(&self) -> LoadOutcome {
        self.collections.reset();
        *self.watermark() = LogicalTimestamp::EPOCH;
        self.load_from_server().await
    }

    /// Re-read the store after another context wrote to it.
    pub fn handle_notification(&self, notification: &ChangeNotification) {
        debug!(key = %notification.key, value = %notification.new_value, "Store changed in another context");
        match self.collections.install_from_local() {
            Ok(Some(install)) if install.applied => {
                self.events
                    .data_updated(UpdateSource::OtherContext, install.snapshot);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to reload after cross-context change"),
        }
    }

    /// Poll the server every `sync_interval` until aborted.
    ///
    /// Each tick runs in its own task: a slow read never delays or cancels
    /// the next tick.
    pub fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let period = engine.settings.sync_interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    engine.load_from_server().await;
                });
            }
        })
    }

    /// Apply notifications from other contexts until aborted.
    pub fn spawn_change_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let (mut notifications, listener) =
            self.channel.listen(self.settings.marker_poll_interval);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(notification) = notifications.recv().await {
                engine.handle_notification(&notification);
            }
            listener.abort();
        })
    }
}
