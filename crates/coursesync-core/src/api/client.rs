//! API client for the content server.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::models::{CollectionName, Collections, LogicalTimestamp, Record, Snapshot};
use crate::transport::{Request, Response, Transport};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) reads.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Where the server's endpoints live.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: Url,
    api_path: String,
    legacy_mirror_path: Option<String>,
}

impl Endpoints {
    pub fn new(base_url: &str, api_path: &str) -> Result<Self, SyncError> {
        let base = Url::parse(base_url)
            .map_err(|e| SyncError::Transport(format!("invalid server url {}: {}", base_url, e)))?;
        Ok(Self {
            base,
            api_path: format!("/{}", api_path.trim_matches('/')),
            legacy_mirror_path: None,
        })
    }

    pub fn with_legacy_mirror(mut self, path: Option<String>) -> Self {
        self.legacy_mirror_path = path;
        self
    }

    /// Path of the full-payload endpoint, e.g. `/api/data`.
    pub fn data_path(&self) -> String {
        format!("{}/data", self.api_path)
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn url(&self, path: &str) -> Result<Url, SyncError> {
        self.base
            .join(path)
            .map_err(|e| SyncError::Transport(format!("invalid path {}: {}", path, e)))
    }

    pub fn data_url(&self) -> Result<Url, SyncError> {
        self.url(&self.data_path())
    }

    pub fn collection_url(&self, name: CollectionName) -> Result<Url, SyncError> {
        self.url(&format!("{}/{}", self.api_path, name))
    }

    pub fn legacy_mirror_url(&self) -> Option<Result<Url, SyncError>> {
        self.legacy_mirror_path.as_deref().map(|path| self.url(path))
    }
}

#[derive(Debug, Deserialize)]
struct WriteAck {
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Serialize)]
struct MirrorPayload<'a> {
    data: &'a Collections,
}

/// Result of reading the full payload.
#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub snapshot: Snapshot,
    /// The offline cache answered; the server was not reached.
    pub from_cache: bool,
}

/// Speaks the server's JSON API over any transport.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    endpoints: Endpoints,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Check if response is successful, returning an error with body if not.
    fn check_response(response: Response) -> Result<Response, SyncError> {
        if response.is_success() {
            Ok(response)
        } else {
            Err(SyncError::from_status(response.status, &response.text()))
        }
    }

    /// Read the full payload.
    ///
    /// The snapshot is stamped with the response's `Last-Modified` time when
    /// the server sends one. Otherwise a fresh read is stamped with the time
    /// of the read and a cache-served one with the time it was captured.
    pub async fn fetch_snapshot(&self) -> Result<FetchedSnapshot, SyncError> {
        let url = self.endpoints.data_url()?;
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.transport.fetch(Request::get(url.clone())).await?;

            if response.status == StatusCode::TOO_MANY_REQUESTS {
                retries += 1;
                if retries > MAX_RATE_LIMIT_RETRIES {
                    return Err(SyncError::RateLimited);
                }
                warn!(url = %url, retry = retries, backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
                continue;
            }

            let response = Self::check_response(response)?;
            let collections = Collections::from_json(&response.body)?;
            let cached_at = response.cached_at();
            let last_sync_time = response
                .header("last-modified")
                .and_then(LogicalTimestamp::from_http_date)
                .or(cached_at)
                .unwrap_or_else(LogicalTimestamp::now);

            debug!(
                courses = collections.courses.len(),
                pricing = collections.pricing.len(),
                internships = collections.internships.len(),
                %last_sync_time,
                from_cache = cached_at.is_some(),
                "Fetched server snapshot"
            );
            return Ok(FetchedSnapshot {
                snapshot: Snapshot::new(collections, last_sync_time),
                from_cache: cached_at.is_some(),
            });
        }
    }

    /// Replace one collection on the server. Never retried.
    pub async fn put_collection(
        &self,
        name: CollectionName,
        records: &[Record],
    ) -> Result<(), SyncError> {
        let url = self.endpoints.collection_url(name)?;
        let response = self.transport.fetch(Request::put_json(url, records)?).await?;
        let response = Self::check_response(response)?;

        // Older servers answer with an empty body
        if response.body.is_empty() {
            return Ok(());
        }
        let ack: WriteAck = response.json()?;
        if ack.success {
            Ok(())
        } else {
            Err(SyncError::Server(format!("write of {} was not acknowledged", name)))
        }
    }

    /// Best-effort mirror of the whole payload to the legacy update endpoint.
    /// Returns `Ok(false)` when no mirror is configured.
    pub async fn mirror_payload(&self, collections: &Collections) -> Result<bool, SyncError> {
        let url = match self.endpoints.legacy_mirror_url() {
            Some(url) => url?,
            None => return Ok(false),
        };
        let request = Request::post_json(url, &MirrorPayload { data: collections })?;
        Self::check_response(self.transport.fetch(request).await?)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{CacheNames, CacheStorage, OfflineCache};
    use crate::testing::{collections_with_courses, course, plan, FakeServer, BASE_URL};
    use reqwest::Method;

    fn client(server: &FakeServer) -> ApiClient {
        let endpoints = Endpoints::new(BASE_URL, "api").expect("endpoints");
        ApiClient::new(server.transport(), endpoints)
    }

    #[test]
    fn test_endpoint_paths() {
        let endpoints = Endpoints::new(BASE_URL, "/api/").expect("endpoints");
        assert_eq!(endpoints.data_path(), "/api/data");
        assert_eq!(
            endpoints.collection_url(CollectionName::Internships).expect("url").as_str(),
            "http://localhost:3000/api/internships"
        );
        assert!(endpoints.legacy_mirror_url().is_none());
        assert!(Endpoints::new("not a url", "api").is_err());
    }

    #[tokio::test]
    async fn test_fetch_snapshot_parses_payload() {
        let server = FakeServer::new(collections_with_courses(vec![course(1, "Rust")]));
        let fetched = client(&server).fetch_snapshot().await.expect("snapshot");
        assert!(!fetched.from_cache);
        assert_eq!(fetched.snapshot.collections.courses.len(), 1);
        assert!(fetched.snapshot.collections.pricing.is_empty());
        assert!(!fetched.snapshot.last_sync_time.is_epoch());
    }

    #[tokio::test]
    async fn test_fetch_snapshot_uses_last_modified() {
        let server = FakeServer::new(Collections::default());
        server.set_last_modified(Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        let fetched = client(&server).fetch_snapshot().await.expect("snapshot");
        assert_eq!(fetched.snapshot.last_sync_time.as_millis(), 1_445_412_480_000);
    }

    #[tokio::test]
    async fn test_cache_served_read_is_flagged_and_stamped_with_capture_time() {
        let server = FakeServer::new(collections_with_courses(vec![course(1, "Rust")]));
        let cache = OfflineCache::new(
            server.transport(),
            CacheStorage::new(),
            CacheNames::new("techinterns-v1", "techinterns-data-v1"),
            Vec::new(),
            "/api/data",
        );
        let endpoints = Endpoints::new(BASE_URL, "api").expect("endpoints");
        let storage = cache.storage().clone();
        let handle = cache.register(true).await.expect("register");
        let client = ApiClient::new(Arc::new(handle), endpoints);

        let fresh = client.fetch_snapshot().await.expect("online");
        assert!(!fresh.from_cache);

        server.set_online(false);
        let served = client.fetch_snapshot().await.expect("cached");
        let captured = storage
            .get("techinterns-data-v1", "http://localhost:3000/api/data")
            .expect("cached entry")
            .cached_at;
        assert!(served.from_cache);
        assert_eq!(served.snapshot.collections, fresh.snapshot.collections);
        assert_eq!(
            served.snapshot.last_sync_time.as_millis(),
            captured.timestamp_millis() as u64
        );
    }

    #[tokio::test]
    async fn test_fetch_snapshot_server_error() {
        let server = FakeServer::new(Collections::default());
        server.set_data_status(StatusCode::INTERNAL_SERVER_ERROR);
        let err = client(&server).fetch_snapshot().await.expect_err("should fail");
        assert!(matches!(err, SyncError::Server(_)));
        assert!(err.is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_snapshot_gives_up_after_rate_limit_retries() {
        let server = FakeServer::new(Collections::default());
        server.set_data_status(StatusCode::TOO_MANY_REQUESTS);
        let err = client(&server).fetch_snapshot().await.expect_err("should fail");
        assert!(matches!(err, SyncError::RateLimited));
        assert_eq!(
            server.count(Method::GET, "/api/data"),
            MAX_RATE_LIMIT_RETRIES as usize + 1
        );
    }

    #[tokio::test]
    async fn test_put_collection_replaces_on_server() {
        let server = FakeServer::new(Collections::default());
        client(&server)
            .put_collection(CollectionName::Pricing, &[plan(1, "Basic")])
            .await
            .expect("put");
        assert_eq!(server.data().pricing, vec![plan(1, "Basic")]);
    }

    #[tokio::test]
    async fn test_put_collection_non_2xx_is_failure() {
        let server = FakeServer::new(Collections::default());
        server.set_put_status(StatusCode::INTERNAL_SERVER_ERROR);
        let result = client(&server)
            .put_collection(CollectionName::Pricing, &[plan(1, "Basic")])
            .await;
        assert!(result.is_err());
        assert!(server.data().pricing.is_empty());
    }

    #[tokio::test]
    async fn test_mirror_payload_only_when_configured() {
        let server = FakeServer::new(Collections::default());
        assert!(!client(&server)
            .mirror_payload(&Collections::default())
            .await
            .expect("no mirror"));

        let endpoints = Endpoints::new(BASE_URL, "api")
            .expect("endpoints")
            .with_legacy_mirror(Some("/update-data.php".to_string()));
        let mirrored = ApiClient::new(server.transport(), endpoints)
            .mirror_payload(&Collections::default())
            .await
            .expect("mirror");
        assert!(mirrored);
        assert_eq!(server.count(Method::POST, "/update-data.php"), 1);
    }
}
