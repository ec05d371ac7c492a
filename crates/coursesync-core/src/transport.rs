//! The network edge.
//!
//! Every request the engine makes goes through a `Transport`. Layers such as
//! the cache buster and the offline cache are transports that wrap another
//! transport, with `HttpTransport` at the bottom.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::SyncError;
use crate::models::LogicalTimestamp;

/// Present on responses the offline cache answered instead of the network.
pub const CACHE_STATUS_HEADER: &str = "x-coursesync-cache";

/// When a cache-served response was captured, in milliseconds since the epoch.
pub const CACHED_AT_HEADER: &str = "x-coursesync-cached-at";

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn put_json<B: Serialize + ?Sized>(url: Url, body: &B) -> Result<Self, SyncError> {
        Self::new(Method::PUT, url).with_json(body)
    }

    pub fn post_json<B: Serialize + ?Sized>(url: Url, body: &B) -> Result<Self, SyncError> {
        Self::new(Method::POST, url).with_json(body)
    }

    fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, SyncError> {
        let bytes = serde_json::to_vec(body)
            .map_err(|e| SyncError::Transport(format!("failed to encode body: {}", e)))?;
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self.body = Some(bytes);
        Ok(self)
    }

    pub fn with_header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.insert(name, HeaderValue::from_static(value));
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self::new(StatusCode::OK, body)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Capture time of a response served from the offline cache, or `None`
    /// when it came from the network.
    pub fn cached_at(&self) -> Option<LogicalTimestamp> {
        if self.header(CACHE_STATUS_HEADER) != Some("hit") {
            return None;
        }
        Some(
            self.header(CACHED_AT_HEADER)
                .and_then(LogicalTimestamp::parse)
                .unwrap_or(LogicalTimestamp::EPOCH),
        )
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, SyncError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Anything that can carry a request to the server and back.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: Request) -> Result<Response, SyncError>;
}

/// The real network, via reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Without a timeout the transport default applies and slow reads simply delay the tick.
    pub fn new(timeout: Option<Duration>) -> Result<Self, SyncError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: Request) -> Result<Response, SyncError> {
        let mut builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
