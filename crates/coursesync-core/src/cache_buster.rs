//! Defeats intermediate HTTP caches for data reads and turns platform
//! signals into forced resyncs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use reqwest::Url;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{LoadOutcome, SyncEngine};
use crate::error::SyncError;
use crate::events::PlatformSignal;
use crate::models::LogicalTimestamp;
use crate::offline::CacheStorage;
use crate::store::{DATA_KEY, LAST_SYNC_KEY};
use crate::transport::{Request, Response, Transport};

/// Query parameter carrying the monotonic stamp.
pub const TIMESTAMP_PARAM: &str = "v";

/// Query parameter carrying the random nonce.
pub const NONCE_PARAM: &str = "cb";

/// Whether `url` addresses the data endpoint at `data_path`.
pub fn targets_data(url: &Url, data_path: &str) -> bool {
    let path = url.path();
    path == data_path
        || path
            .strip_prefix(data_path)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// `url` without the cache-busting parameters.
pub fn strip_bust_params(url: &Url) -> Url {
    let mut stripped = url.clone();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != TIMESTAMP_PARAM && key != NONCE_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if kept.is_empty() {
        stripped.set_query(None);
    } else {
        stripped.query_pairs_mut().clear().extend_pairs(kept);
    }
    stripped.set_fragment(None);
    stripped
}

/// Wraps the fetch entry point for the whole session.
pub struct CacheBustingTransport {
    inner: Arc<dyn Transport>,
    data_path: String,
    last_stamp: AtomicU64,
}

impl CacheBustingTransport {
    pub fn new(inner: Arc<dyn Transport>, data_path: impl Into<String>) -> Self {
        Self {
            inner,
            data_path: data_path.into(),
            last_stamp: AtomicU64::new(0),
        }
    }

    /// Strictly increasing, even when called twice in one millisecond.
    fn next_stamp(&self) -> u64 {
        let now = LogicalTimestamp::now().as_millis();
        let mut previous = self.last_stamp.load(Ordering::Relaxed);
        loop {
            let next = now.max(previous + 1);
            match self.last_stamp.compare_exchange_weak(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    fn bust(&self, mut request: Request) -> Request {
        let stamp = self.next_stamp();
        let nonce: u64 = rand::random();
        request
            .url
            .query_pairs_mut()
            .append_pair(TIMESTAMP_PARAM, &stamp.to_string())
            .append_pair(NONCE_PARAM, &format!("{:016x}", nonce));
        request
            .with_header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .with_header(PRAGMA, "no-cache")
            .with_header(EXPIRES, "0")
    }
}

#[async_trait]
impl Transport for CacheBustingTransport {
    async fn fetch(&self, request: Request) -> Result<Response, SyncError> {
        let request = if targets_data(&request.url, &self.data_path) {
            self.bust(request)
        } else {
            request
        };
        self.inner.fetch(request).await
    }
}

/// Session-level reactions: forced resync on platform signals and the
/// manual cache reset.
pub struct CacheBuster {
    engine: Arc<SyncEngine>,
    offline: Option<CacheStorage>,
}

impl CacheBuster {
    pub fn new(engine: Arc<SyncEngine>, offline: Option<CacheStorage>) -> Self {
        Self { engine, offline }
    }

    /// Force a resync for every visibility or connectivity signal.
    pub fn spawn_signal_listener(
        &self,
        mut signals: broadcast::Receiver<PlatformSignal>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            loop {
                let signal = match signals.recv().await {
                    Ok(signal) => signal,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Platform signals lagged");
                        PlatformSignal::VisibilityRegained
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                info!(?signal, "Platform signal, forcing sync");
                engine.force_sync().await;
            }
        })
    }

    /// Drop every cached copy of the data and reload from scratch.
    ///
    /// This is the manual escape hatch, not part of normal sync.
    pub async fn clear_all_cache(&self) -> LoadOutcome {
        let scope = self.engine.collections().scope();
        let context = self.engine.context();
        for key in [DATA_KEY, LAST_SYNC_KEY] {
            if let Err(e) = scope.remove(context, key) {
                warn!(key, error = %e, "Failed to clear stored key");
            }
        }

        if let Some(storage) = &self.offline {
            let deleted = storage.clear();
            info!(deleted, "Deleted offline cache generations");
        }

        self.engine.reload().await
    }
}
