//! In-memory fakes shared by the unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use reqwest::header::HeaderValue;
use reqwest::{Method, StatusCode, Url};

use crate::error::SyncError;
use crate::models::{CollectionName, Collections, Record};
use crate::store::{MemoryStore, StorageScope};
use crate::transport::{Request, Response, Transport};

pub const BASE_URL: &str = "http://localhost:3000";

pub fn url(path: &str) -> Url {
    Url::parse(BASE_URL)
        .and_then(|base| base.join(path))
        .expect("test url")
}

pub fn course(id: i64, title: &str) -> Record {
    Record::new(id).with("title", title)
}

pub fn plan(id: i64, name: &str) -> Record {
    Record::new(id).with("plan", name)
}

pub fn collections_with_courses(courses: Vec<Record>) -> Collections {
    Collections {
        courses,
        ..Collections::default()
    }
}

pub fn memory_scope() -> StorageScope {
    StorageScope::new(Arc::new(MemoryStore::new()))
}

struct FakeState {
    online: bool,
    data: Collections,
    last_modified: Option<&'static str>,
    data_status: StatusCode,
    put_status: StatusCode,
    assets: HashMap<String, Vec<u8>>,
    requests: Vec<Request>,
}

/// A scripted server speaking the `/api` protocol.
#[derive(Clone)]
pub struct FakeServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeServer {
    pub fn new(data: Collections) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                online: true,
                data,
                last_modified: None,
                data_status: StatusCode::OK,
                put_status: StatusCode::OK,
                assets: HashMap::new(),
                requests: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.clone())
    }

    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    pub fn set_data(&self, data: Collections) {
        self.state().data = data;
    }

    pub fn data(&self) -> Collections {
        self.state().data.clone()
    }

    pub fn set_last_modified(&self, value: Option<&'static str>) {
        self.state().last_modified = value;
    }

    pub fn set_data_status(&self, status: StatusCode) {
        self.state().data_status = status;
    }

    pub fn set_put_status(&self, status: StatusCode) {
        self.state().put_status = status;
    }

    pub fn add_asset(&self, path: &str, body: &str) {
        self.state().assets.insert(path.to_string(), body.as_bytes().to_vec());
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state().requests.clone()
    }

    pub fn count(&self, method: Method, path: &str) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.method == method && r.url.path() == path)
            .count()
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn fetch(&self, request: Request) -> Result<Response, SyncError> {
        let mut state = self.state();
        if !state.online {
            return Err(SyncError::Transport("connection refused".to_string()));
        }
        state.requests.push(request.clone());

        let path = request.url.path().to_string();
        if request.method == Method::GET && path == "/api/data" {
            if state.data_status != StatusCode::OK {
                return Ok(Response::new(state.data_status, "unavailable"));
            }
            let body = serde_json::to_vec(&state.data).expect("encode fake data");
            let mut response = Response::ok(body);
            if let Some(value) = state.last_modified {
                response
                    .headers
                    .insert("last-modified", HeaderValue::from_static(value));
            }
            return Ok(response);
        }

        if request.method == Method::PUT {
            if let Some(name) = path.strip_prefix("/api/") {
                if state.put_status != StatusCode::OK {
                    return Ok(Response::new(state.put_status, r#"{"error":"write failed"}"#));
                }
                let name: CollectionName = match name.parse() {
                    Ok(name) => name,
                    Err(_) => return Ok(Response::new(StatusCode::NOT_FOUND, "")),
                };
                let records: Vec<Record> =
                    serde_json::from_slice(request.body.as_deref().unwrap_or_default())?;
                state.data.set(name, records);
                return Ok(Response::ok(r#"{"success":true}"#));
            }
        }

        if request.method == Method::POST {
            return Ok(Response::ok(r#"{"success":true}"#));
        }

        match state.assets.get(&path) {
            Some(body) => Ok(Response::ok(body.clone())),
            None => Ok(Response::new(StatusCode::NOT_FOUND, "not found")),
        }
    }
}
