//! One running client: storage, transports, engine and background tasks.
//!
//! Requests flow `ApiClient -> CacheBustingTransport -> OfflineCacheHandle
//! -> network`. The offline layer is optional. When its precache fails and
//! no earlier generations are stored, the session logs it and talks to the
//! network directly.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::ApiClient;
use crate::cache_buster::{CacheBuster, CacheBustingTransport};
use crate::config::Config;
use crate::engine::{LoadOutcome, PropagateOutcome, SyncEngine, SyncState};
use crate::error::SyncError;
use crate::events::{EventBus, PlatformSignal, SyncEvent};
use crate::models::{CollectionName, LogicalTimestamp, Record, Snapshot};
use crate::offline::{CacheStorage, OfflineCache, OfflineCacheHandle, WorkerState};
use crate::store::file::age_display;
use crate::store::{ContextId, FileStore, StorageScope, LAST_SYNC_KEY};
use crate::transport::{HttpTransport, Transport};

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub context: ContextId,
    pub state: SyncState,
    pub last_sync_time: LogicalTimestamp,
    /// Age of the stored copy, e.g. "5m ago".
    pub stored_age: Option<String>,
    pub total_records: usize,
    pub offline_worker: Option<WorkerState>,
    pub initial_load: LoadOutcome,
}

pub struct SyncSession {
    engine: Arc<SyncEngine>,
    buster: CacheBuster,
    offline: Option<OfflineCacheHandle>,
    signals: broadcast::Sender<PlatformSignal>,
    tasks: Vec<JoinHandle<()>>,
    initial_load: LoadOutcome,
}

impl SyncSession {
    /// Start a session against the configured server with on-disk storage.
    pub async fn start(config: &Config) -> Result<Self> {
        let store = FileStore::new(config.store_dir()?)?;
        info!(dir = %store.dir().display(), "Using local store");
        let scope = StorageScope::new(Arc::new(store));
        let storage = CacheStorage::open(config.offline_cache_dir()?)?;
        let network: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.request_timeout())?);
        Self::start_with(config, scope, network, storage).await
    }

    /// Start a session over an explicit store scope, network transport and
    /// offline cache storage.
    pub async fn start_with(
        config: &Config,
        scope: StorageScope,
        network: Arc<dyn Transport>,
        storage: CacheStorage,
    ) -> Result<Self> {
        let endpoints = config.endpoints()?;
        let data_path = endpoints.data_path();

        let (edge, offline) = if config.offline_cache {
            let cache = OfflineCache::new(
                Arc::clone(&network),
                storage.clone(),
                config.cache_names(),
                config.manifest_urls()?,
                data_path.as_str(),
            );
            match cache.register(config.skip_waiting).await {
                Ok(handle) => {
                    let edge: Arc<dyn Transport> = Arc::new(handle.clone());
                    (edge, Some(handle))
                }
                Err(e) => {
                    warn!(error = %e, "Offline cache registration failed, continuing without it");
                    (network, None)
                }
            }
        } else {
            (network, None)
        };

        let transport = Arc::new(CacheBustingTransport::new(edge, data_path));
        let api = ApiClient::new(transport, endpoints);
        let engine = Arc::new(SyncEngine::new(
            api,
            scope,
            ContextId::random(),
            EventBus::new(),
            config.engine_settings(),
        ));
        let buster = CacheBuster::new(Arc::clone(&engine), Some(storage));

        let initial_load = engine.initial_load().await;

        let signals = engine.signal_sender();
        let tasks = vec![
            engine.spawn_periodic(),
            engine.spawn_change_listener(),
            buster.spawn_signal_listener(engine.subscribe_signals()),
        ];

        Ok(Self {
            engine,
            buster,
            offline,
            signals,
            tasks,
            initial_load,
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.engine.current()
    }

    pub fn collection(&self, name: CollectionName) -> Vec<Record> {
        self.engine.collections().collection(name)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.engine.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.engine.watch_state()
    }

    pub async fn force_sync(&self) -> LoadOutcome {
        self.engine.force_sync().await
    }

    pub async fn propagate(
        &self,
        name: CollectionName,
        records: Vec<Record>,
    ) -> Result<PropagateOutcome, SyncError> {
        self.engine.propagate(name, records).await
    }

    /// Deliver a visibility or connectivity signal from the platform.
    pub fn signal(&self, signal: PlatformSignal) {
        if self.signals.send(signal).is_err() {
            warn!(?signal, "Signal listener is not running");
        }
    }

    pub async fn clear_all_cache(&self) -> LoadOutcome {
        self.buster.clear_all_cache().await
    }

    /// Drop only the offline data cache; returns whether one existed.
    pub async fn clear_data_cache(&self) -> Result<bool, SyncError> {
        match &self.offline {
            Some(handle) => handle.clear_data_cache().await,
            None => Ok(false),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let snapshot = self.engine.current();
        let stored_age = match self
            .engine
            .collections()
            .scope()
            .backend()
            .stored_at(LAST_SYNC_KEY)
        {
            Ok(stored_at) => stored_at.map(|at| age_display((Utc::now() - at).num_minutes())),
            Err(e) => {
                warn!(error = %e, "Failed to read store metadata");
                None
            }
        };
        let offline_worker = match &self.offline {
            Some(handle) => handle.state().await.ok(),
            None => None,
        };

        SessionStatus {
            context: self.engine.context(),
            state: self.engine.state(),
            last_sync_time: snapshot.last_sync_time,
            stored_age,
            total_records: snapshot.collections.total_records(),
            offline_worker,
            initial_load: self.initial_load,
        }
    }

    /// Stop polling and listening; in-flight requests are abandoned.
    pub fn shutdown(mut self) {
        self.abort_tasks();
        info!(context = %self.engine.context(), "Sync session stopped");
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}
