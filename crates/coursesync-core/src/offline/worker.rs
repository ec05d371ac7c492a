use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use reqwest::{Method, StatusCode, Url};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::storage::CacheStorage;
use crate::cache_buster::{strip_bust_params, targets_data};
use crate::error::SyncError;
use crate::transport::{Request, Response, Transport};

/// Commands buffered between handles and the worker task.
const COMMAND_BUFFER_SIZE: usize = 32;

/// Names of the two cache generations the current configuration owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
    pub static_assets: String,
    pub data: String,
}

impl CacheNames {
    pub fn new(static_assets: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            static_assets: static_assets.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Precached but not yet serving; requests pass straight through.
    Installed,
    Activated,
}

#[derive(Debug)]
pub enum WorkerMessage {
    SkipWaiting,
    /// Delete the data generation; acknowledged with whether it existed.
    ClearDataCache { ack: oneshot::Sender<bool> },
}

enum WorkerCommand {
    Fetch {
        request: Request,
        reply: oneshot::Sender<Result<Response, SyncError>>,
    },
    Message(WorkerMessage),
    State {
        reply: oneshot::Sender<WorkerState>,
    },
}

fn cache_key(url: &Url) -> String {
    strip_bust_params(url).into()
}

/// Caching policy in front of the network.
#[derive(Clone)]
pub struct OfflineCache {
    names: CacheNames,
    manifest: Arc<Vec<Url>>,
    data_path: String,
    network: Arc<dyn Transport>,
    storage: CacheStorage,
}

impl OfflineCache {
    pub fn new(
        network: Arc<dyn Transport>,
        storage: CacheStorage,
        names: CacheNames,
        manifest: Vec<Url>,
        data_path: impl Into<String>,
    ) -> Self {
        Self {
            names,
            manifest: Arc::new(manifest),
            data_path: data_path.into(),
            network,
            storage,
        }
    }

    pub fn names(&self) -> &CacheNames {
        &self.names
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// Fetch every manifest entry and commit them together.
    ///
    /// Any failure or non-200 aborts the install and nothing is cached.
    pub async fn install(&self) -> Result<usize, SyncError> {
        let fetches = self.manifest.iter().map(|url| async move {
            let response = self
                .network
                .fetch(Request::get(url.clone()))
                .await
                .map_err(|e| SyncError::PrecacheFailure {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
            if response.status != StatusCode::OK {
                return Err(SyncError::PrecacheFailure {
                    url: url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok((cache_key(url), response))
        });

        let entries = try_join_all(fetches).await?;
        let count = entries.len();
        self.storage.put_all(&self.names.static_assets, entries);
        info!(count, cache = %self.names.static_assets, "Precached static assets");
        Ok(count)
    }

    /// Delete every generation the current configuration does not name.
    pub fn activate(&self) -> Vec<String> {
        let deleted = self
            .storage
            .retain_only(&[self.names.static_assets.as_str(), self.names.data.as_str()]);
        for name in &deleted {
            info!(cache = %name, "Deleted old cache generation");
        }
        deleted
    }

    pub fn clear_data_cache(&self) -> bool {
        self.storage.delete(&self.names.data)
    }

    /// Serve one request the way an active worker does.
    pub async fn handle(&self, request: Request) -> Result<Response, SyncError> {
        if request.method != Method::GET {
            return self.network.fetch(request).await;
        }
        if targets_data(&request.url, &self.data_path) {
            self.network_first(request).await
        } else {
            self.cache_first(request).await
        }
    }

    async fn network_first(&self, request: Request) -> Result<Response, SyncError> {
        let key = cache_key(&request.url);
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    self.storage.put(&self.names.data, &key, response.clone());
                }
                Ok(response)
            }
            Err(e) => match self.storage.match_any(&key) {
                Some(cached) => {
                    debug!(%key, age_minutes = cached.age_minutes(), error = %e, "Network failed, serving cached data");
                    Ok(cached.served())
                }
                None => Err(e),
            },
        }
    }

    /// Data entries are never served here; only `network_first` reads them.
    async fn cache_first(&self, request: Request) -> Result<Response, SyncError> {
        let key = cache_key(&request.url);
        match self.storage.match_except(&key, Some(self.names.data.as_str())) {
            Some(cached) => Ok(cached.served()),
            None => self.network.fetch(request).await,
        }
    }

    /// Install, then start the worker task.
    ///
    /// With `skip_waiting` the worker activates right away; otherwise it
    /// waits for `WorkerMessage::SkipWaiting`. When the install fails but
    /// generations from an earlier run are still stored, the worker keeps
    /// serving those as they are and deletes nothing.
    pub async fn register(self, skip_waiting: bool) -> Result<OfflineCacheHandle, SyncError> {
        let state = match self.install().await {
            Ok(_) if skip_waiting => {
                self.activate();
                WorkerState::Activated
            }
            Ok(_) => WorkerState::Installed,
            Err(e) if !self.storage.names().is_empty() => {
                warn!(error = %e, generations = ?self.storage.names(), "Install failed, serving previously cached generations");
                WorkerState::Activated
            }
            Err(e) => return Err(e),
        };

        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER_SIZE);
        tokio::spawn(self.run(receiver, state));
        Ok(OfflineCacheHandle { commands })
    }

    async fn run(self, mut commands: mpsc::Receiver<WorkerCommand>, mut state: WorkerState) {
        debug!(?state, "Offline cache worker started");
        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Fetch { request, reply } => {
                    let worker = self.clone();
                    let active = state == WorkerState::Activated;
                    tokio::spawn(async move {
                        let result = if active {
                            worker.handle(request).await
                        } else {
                            worker.network.fetch(request).await
                        };
                        // Caller gave up waiting
                        let _ = reply.send(result);
                    });
                }
                WorkerCommand::Message(WorkerMessage::SkipWaiting) => {
                    if state != WorkerState::Activated {
                        self.activate();
                        state = WorkerState::Activated;
                    }
                }
                WorkerCommand::Message(WorkerMessage::ClearDataCache { ack }) => {
                    let existed = self.clear_data_cache();
                    info!(existed, cache = %self.names.data, "Cleared data cache");
                    let _ = ack.send(existed);
                }
                WorkerCommand::State { reply } => {
                    let _ = reply.send(state);
                }
            }
        }
        debug!("Offline cache worker stopped");
    }
}

/// Cheap handle to a running worker; also the transport requests go through.
#[derive(Clone)]
pub struct OfflineCacheHandle {
    commands: mpsc::Sender<WorkerCommand>,
}

impl OfflineCacheHandle {
    async fn send(&self, command: WorkerCommand) -> Result<(), SyncError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::WorkerUnavailable)
    }

    pub async fn post_message(&self, message: WorkerMessage) -> Result<(), SyncError> {
        self.send(WorkerCommand::Message(message)).await
    }

    pub async fn skip_waiting(&self) -> Result<(), SyncError> {
        self.post_message(WorkerMessage::SkipWaiting).await
    }

    pub async fn clear_data_cache(&self) -> Result<bool, SyncError> {
        let (ack, rx) = oneshot::channel();
        self.post_message(WorkerMessage::ClearDataCache { ack }).await?;
        rx.await.map_err(|_| SyncError::WorkerUnavailable)
    }

    pub async fn state(&self) -> Result<WorkerState, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::State { reply }).await?;
        rx.await.map_err(|_| SyncError::WorkerUnavailable)
    }
}

#[async_trait]
impl Transport for OfflineCacheHandle {
    async fn fetch(&self, request: Request) -> Result<Response, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.send(WorkerCommand::Fetch { request, reply }).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                warn!("Offline cache worker dropped a request");
                Err(SyncError::WorkerUnavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Collections;
    use crate::testing::{collections_with_courses, course, url, FakeServer};

    const MANIFEST: [&str; 3] = ["/", "/index.html", "/css/style.css"];

    fn server_with_assets() -> FakeServer {
        let server = FakeServer::new(collections_with_courses(vec![course(1, "Rust")]));
        for path in MANIFEST {
            server.add_asset(path, &format!("asset {}", path));
        }
        server
    }

    fn offline_cache(server: &FakeServer, storage: CacheStorage) -> OfflineCache {
        OfflineCache::new(
            server.transport(),
            storage,
            CacheNames::new("techinterns-v1", "techinterns-data-v1"),
            MANIFEST.iter().map(|path| url(path)).collect(),
            "/api/data",
        )
    }

    #[tokio::test]
    async fn test_install_precaches_manifest() {
        let server = server_with_assets();
        let cache = offline_cache(&server, CacheStorage::new());
        assert_eq!(cache.install().await.expect("install"), 3);
        assert_eq!(cache.storage().len("techinterns-v1"), 3);
    }

    #[tokio::test]
    async fn test_install_is_all_or_nothing() {
        let server = FakeServer::new(Collections::default());
        server.add_asset("/", "home");
        server.add_asset("/index.html", "index");
        let cache = offline_cache(&server, CacheStorage::new());

        let err = cache.install().await.expect_err("missing asset");
        assert!(matches!(err, SyncError::PrecacheFailure { ref url, .. } if url.ends_with("/css/style.css")));
        assert!(!cache.storage().has("techinterns-v1"));
    }

    #[tokio::test]
    async fn test_activate_deletes_unnamed_generations() {
        let server = server_with_assets();
        let storage = CacheStorage::new();
        storage.put("techinterns-v0", "/", Response::ok("stale"));
        storage.put("techinterns-data-v1", "/api/data", Response::ok("{}"));

        let cache = offline_cache(&server, storage.clone());
        cache.install().await.expect("install");
        assert_eq!(cache.activate(), vec!["techinterns-v0".to_string()]);
        assert_eq!(
            storage.names(),
            vec!["techinterns-data-v1".to_string(), "techinterns-v1".to_string()]
        );
    }

    #[tokio::test]
    async fn test_online_data_read_is_cached_and_returned_unmodified() {
        let server = server_with_assets();
        let cache = offline_cache(&server, CacheStorage::new());

        let busted = url("/api/data?v=10&cb=ff");
        let response = cache.handle(Request::get(busted)).await.expect("fetch");
        let expected = serde_json::to_vec(&server.data()).expect("encode");
        assert_eq!(response.body, expected);

        let cached = cache
            .storage()
            .get("techinterns-data-v1", "http://localhost:3000/api/data")
            .expect("cached under the stripped url");
        assert_eq!(cached.response, response);
    }

    #[tokio::test]
    async fn test_offline_data_read_serves_cached_copy() {
        let server = server_with_assets();
        let cache = offline_cache(&server, CacheStorage::new());
        cache
            .handle(Request::get(url("/api/data?v=1&cb=a")))
            .await
            .expect("warm");

        server.set_online(false);
        let response = cache
            .handle(Request::get(url("/api/data?v=2&cb=b")))
            .await
            .expect("served from cache");
        assert!(response.is_success());
        assert_eq!(response.body, serde_json::to_vec(&server.data()).expect("encode"));
        assert!(response.cached_at().is_some());
    }

    #[tokio::test]
    async fn test_offline_data_read_without_cache_propagates_error() {
        let server = server_with_assets();
        server.set_online(false);
        let cache = offline_cache(&server, CacheStorage::new());
        let err = cache
            .handle(Request::get(url("/api/data")))
            .await
            .expect_err("nothing cached");
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn test_non_200_data_response_is_not_cached() {
        let server = server_with_assets();
        server.set_data_status(StatusCode::SERVICE_UNAVAILABLE);
        let cache = offline_cache(&server, CacheStorage::new());
        let response = cache.handle(Request::get(url("/api/data"))).await.expect("fetch");
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!cache.storage().has("techinterns-data-v1"));
    }

    #[tokio::test]
    async fn test_static_assets_are_cache_first() {
        let server = server_with_assets();
        let cache = offline_cache(&server, CacheStorage::new());
        cache.install().await.expect("install");
        server.set_online(false);

        let response = cache
            .handle(Request::get(url("/css/style.css")))
            .await
            .expect("cached asset");
        assert_eq!(response.text(), "asset /css/style.css");

        server.set_online(true);
        let response = cache
            .handle(Request::get(url("/about.html")))
            .await
            .expect("network fallback");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_writes_bypass_cache() {
        let server = server_with_assets();
        let cache = offline_cache(&server, CacheStorage::new());
        let request = Request::put_json(url("/api/courses"), &vec![course(1, "New")]).expect("request");
        cache.handle(request).await.expect("put");
        assert_eq!(server.count(Method::PUT, "/api/courses"), 1);
        assert!(cache.storage().names().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_worker_passes_through_until_skip_waiting() {
        let server = server_with_assets();
        let storage = CacheStorage::new();
        let handle = offline_cache(&server, storage.clone())
            .register(false)
            .await
            .expect("register");
        assert_eq!(handle.state().await.expect("state"), WorkerState::Installed);

        handle.fetch(Request::get(url("/api/data"))).await.expect("fetch");
        assert!(!storage.has("techinterns-data-v1"));

        handle.skip_waiting().await.expect("skip");
        assert_eq!(handle.state().await.expect("state"), WorkerState::Activated);
        handle.fetch(Request::get(url("/api/data"))).await.expect("fetch");
        assert!(storage.has("techinterns-data-v1"));
    }

    #[tokio::test]
    async fn test_clear_data_cache_message_is_acknowledged() {
        let server = server_with_assets();
        let storage = CacheStorage::new();
        let handle = offline_cache(&server, storage.clone())
            .register(true)
            .await
            .expect("register");

        handle.fetch(Request::get(url("/api/data"))).await.expect("fetch");
        assert!(handle.clear_data_cache().await.expect("ack"));
        assert!(!handle.clear_data_cache().await.expect("ack"));
        assert!(storage.has("techinterns-v1"));
    }

    #[tokio::test]
    async fn test_failed_precache_leaves_no_worker() {
        let server = FakeServer::new(Collections::default());
        let result = offline_cache(&server, CacheStorage::new()).register(true).await;
        assert!(matches!(result, Err(SyncError::PrecacheFailure { .. })));
    }

    #[tokio::test]
    async fn test_data_entries_are_not_served_to_other_reads() {
        let server = server_with_assets();
        let storage = CacheStorage::new();
        storage.put("techinterns-data-v1", "http://localhost:3000/report.json", Response::ok("{}"));
        let cache = offline_cache(&server, storage);

        let response = cache
            .handle(Request::get(url("/report.json")))
            .await
            .expect("network");
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert!(response.cached_at().is_none());
    }

    #[tokio::test]
    async fn test_restart_offline_serves_generations_from_disk() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let server = server_with_assets();
        let storage = CacheStorage::open(dir.path().to_path_buf()).expect("open");
        let handle = offline_cache(&server, storage)
            .register(true)
            .await
            .expect("register");
        handle.fetch(Request::get(url("/api/data?v=1&cb=a"))).await.expect("warm");
        drop(handle);

        server.set_online(false);
        let storage = CacheStorage::open(dir.path().to_path_buf()).expect("reopen");
        let handle = offline_cache(&server, storage)
            .register(true)
            .await
            .expect("old generations keep serving");
        assert_eq!(handle.state().await.expect("state"), WorkerState::Activated);

        let asset = handle.fetch(Request::get(url("/index.html"))).await.expect("asset");
        assert_eq!(asset.text(), "asset /index.html");
        let data = handle.fetch(Request::get(url("/api/data?v=2&cb=b"))).await.expect("data");
        assert_eq!(data.body, serde_json::to_vec(&server.data()).expect("encode"));
    }

    #[tokio::test]
    async fn test_failed_reinstall_keeps_older_generations() {
        let server = server_with_assets();
        let storage = CacheStorage::new();
        storage.put("techinterns-v0", "http://localhost:3000/", Response::ok("old home"));
        server.set_online(false);

        let handle = offline_cache(&server, storage.clone())
            .register(true)
            .await
            .expect("register");
        assert!(storage.has("techinterns-v0"));
        let home = handle.fetch(Request::get(url("/"))).await.expect("home");
        assert_eq!(home.text(), "old home");
    }
}
