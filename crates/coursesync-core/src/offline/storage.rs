use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::transport::{Response, CACHED_AT_HEADER, CACHE_STATUS_HEADER};

/// Creation order of the generations on disk.
const INDEX_FILE: &str = "generations.json";

/// Prefix of half-written generation directories.
const STAGING_PREFIX: &str = ".staging-";

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub response: Response,
    pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn new(response: Response) -> Self {
        Self {
            response,
            cached_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.cached_at).num_minutes()
    }

    /// The response as handed back to a caller, marked as cache-served.
    pub fn served(&self) -> Response {
        let mut response = self.response.clone();
        response
            .headers
            .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("hit"));
        let millis = self.cached_at.timestamp_millis().max(0) as u64;
        response
            .headers
            .insert(CACHED_AT_HEADER, HeaderValue::from(millis));
        response
    }
}

/// One entry file: the request key plus the response it maps to.
#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    cached_at: DateTime<Utc>,
}

impl StoredEntry {
    fn from_cached(key: &str, cached: &CachedResponse) -> Self {
        let headers = cached
            .response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            key: key.to_string(),
            status: cached.response.status.as_u16(),
            headers,
            body: cached.response.body.clone(),
            cached_at: cached.cached_at,
        }
    }

    fn into_cached(self) -> Option<(String, CachedResponse)> {
        let status = StatusCode::from_u16(self.status).ok()?;
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                headers.append(name, value);
            }
        }
        let response = Response {
            status,
            headers,
            body: self.body,
        };
        Some((
            self.key,
            CachedResponse {
                response,
                cached_at: self.cached_at,
            },
        ))
    }
}

struct Entry {
    cached: CachedResponse,
    file: String,
}

struct Generation {
    name: String,
    entries: HashMap<String, Entry>,
}

impl Generation {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }
}

struct Inner {
    root: Option<PathBuf>,
    generations: Vec<Generation>,
}

fn entry_file_name() -> String {
    format!("{:016x}.json", rand::random::<u64>())
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), SyncError> {
    let dir = path
        .parent()
        .ok_or_else(|| SyncError::StoreUnavailable(format!("no parent for {}", path.display())))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(SyncError::store)?;
    tmp.write_all(contents).map_err(SyncError::store)?;
    tmp.persist(path).map_err(|e| SyncError::store(e.error))?;
    Ok(())
}

impl Inner {
    fn position(&self, name: &str) -> Option<usize> {
        self.generations.iter().position(|g| g.name == name)
    }

    fn generation_dir(&self, name: &str) -> Option<PathBuf> {
        self.root.as_ref().map(|root| root.join(name))
    }

    fn write_index(&self) -> Result<(), SyncError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        let names: Vec<&str> = self.generations.iter().map(|g| g.name.as_str()).collect();
        let contents = serde_json::to_vec_pretty(&names).map_err(SyncError::store)?;
        write_file(&root.join(INDEX_FILE), &contents)
    }

    /// Index of `name`, creating an empty generation if needed.
    fn ensure(&mut self, name: &str) -> Result<usize, SyncError> {
        if let Some(index) = self.position(name) {
            return Ok(index);
        }
        if let Some(dir) = self.generation_dir(name) {
            std::fs::create_dir_all(&dir).map_err(SyncError::store)?;
        }
        self.generations.push(Generation::new(name));
        self.write_index()?;
        Ok(self.generations.len() - 1)
    }

    fn write_entry(
        &self,
        dir: &Path,
        file: &str,
        key: &str,
        cached: &CachedResponse,
    ) -> Result<(), SyncError> {
        let contents = serde_json::to_vec(&StoredEntry::from_cached(key, cached))
            .map_err(SyncError::store)?;
        write_file(&dir.join(file), &contents)
    }

    fn insert(&mut self, name: &str, key: &str, cached: CachedResponse) -> Result<(), SyncError> {
        let index = self.ensure(name)?;
        let file = match self.generations[index].entries.get(key) {
            Some(existing) => existing.file.clone(),
            None => entry_file_name(),
        };
        if let Some(dir) = self.generation_dir(name) {
            self.write_entry(&dir, &file, key, &cached)?;
        }
        self.generations[index]
            .entries
            .insert(key.to_string(), Entry { cached, file });
        Ok(())
    }

    /// Write a brand-new generation beside the others and move it into
    /// place with one rename.
    fn create_staged(
        &mut self,
        root: &Path,
        name: &str,
        entries: Vec<(String, CachedResponse)>,
    ) -> Result<(), SyncError> {
        let staging = root.join(format!("{}{:016x}", STAGING_PREFIX, rand::random::<u64>()));
        std::fs::create_dir_all(&staging).map_err(SyncError::store)?;

        let mut generation = Generation::new(name);
        let written = entries.into_iter().try_for_each(|(key, cached)| {
            let file = entry_file_name();
            self.write_entry(&staging, &file, &key, &cached)?;
            generation.entries.insert(key, Entry { cached, file });
            Ok::<(), SyncError>(())
        });
        let target = root.join(name);
        let committed = written.and_then(|()| {
            // A directory the index does not list is left over from a crash
            if target.exists() {
                std::fs::remove_dir_all(&target).map_err(SyncError::store)?;
            }
            std::fs::rename(&staging, &target).map_err(SyncError::store)
        });
        if let Err(e) = committed {
            let _ = std::fs::remove_dir_all(&staging);
            return Err(e);
        }

        self.generations.push(generation);
        self.write_index()
    }

    fn insert_in_memory(&mut self, name: &str, key: String, cached: CachedResponse) {
        let index = match self.position(name) {
            Some(index) => index,
            None => {
                self.generations.push(Generation::new(name));
                self.generations.len() - 1
            }
        };
        let generation = &mut self.generations[index];
        let file = match generation.entries.get(&key) {
            Some(existing) => existing.file.clone(),
            None => entry_file_name(),
        };
        generation.entries.insert(key, Entry { cached, file });
    }

    fn remove(&mut self, index: usize) -> Generation {
        let generation = self.generations.remove(index);
        if let Some(dir) = self.generation_dir(&generation.name) {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!(cache = %generation.name, error = %e, "Failed to delete cache generation");
            }
        }
        generation
    }
}

/// Named cache generations, searched in creation order.
///
/// A storage opened on a directory keeps one subdirectory per generation
/// with one JSON file per entry, so generations outlive the process.
#[derive(Clone)]
pub struct CacheStorage {
    inner: Arc<Mutex<Inner>>,
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::from_inner(Inner {
            root: None,
            generations: Vec::new(),
        })
    }
}

impl CacheStorage {
    /// Storage that lives only as long as the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or create) storage under `root`, loading every generation
    /// already there.
    pub fn open(root: PathBuf) -> Result<Self, SyncError> {
        std::fs::create_dir_all(&root).map_err(SyncError::store)?;
        Self::remove_staging(&root);

        let names: Vec<String> = match std::fs::read_to_string(root.join(INDEX_FILE)) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(error = %e, "Cache index unreadable, starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        let mut generations = Vec::new();
        for name in names {
            let dir = root.join(&name);
            if !dir.is_dir() {
                continue;
            }
            generations.push(Self::load_generation(&dir, &name));
        }
        debug!(root = %root.display(), generations = generations.len(), "Opened offline cache");

        Ok(Self::from_inner(Inner {
            root: Some(root),
            generations,
        }))
    }

    fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn remove_staging(root: &Path) {
        let Ok(entries) = std::fs::read_dir(root) else {
            return;
        };
        for entry in entries.flatten() {
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                let _ = std::fs::remove_dir_all(entry.path());
            }
        }
    }

    fn load_generation(dir: &Path, name: &str) -> Generation {
        let mut generation = Generation::new(name);
        let Ok(files) = std::fs::read_dir(dir) else {
            return generation;
        };
        for file in files.flatten() {
            let file_name = file.file_name().to_string_lossy().into_owned();
            let stored = std::fs::read_to_string(file.path())
                .ok()
                .and_then(|contents| serde_json::from_str::<StoredEntry>(&contents).ok());
            match stored.and_then(StoredEntry::into_cached) {
                Some((key, cached)) => {
                    generation.entries.insert(
                        key,
                        Entry {
                            cached,
                            file: file_name,
                        },
                    );
                }
                None => debug!(file = %file_name, cache = %name, "Skipping unreadable cache entry"),
            }
        }
        generation
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn root(&self) -> Option<PathBuf> {
        self.inner().root.clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.inner().generations.iter().map(|g| g.name.clone()).collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner().position(name).is_some()
    }

    pub fn len(&self, name: &str) -> usize {
        let inner = self.inner();
        inner
            .position(name)
            .map(|index| inner.generations[index].entries.len())
            .unwrap_or(0)
    }

    pub fn get(&self, name: &str, key: &str) -> Option<CachedResponse> {
        let inner = self.inner();
        let index = inner.position(name)?;
        inner.generations[index]
            .entries
            .get(key)
            .map(|entry| entry.cached.clone())
    }

    /// Store one entry, replacing any previous response for `key`.
    ///
    /// A failed disk write is logged; the entry still serves this process.
    pub fn put(&self, name: &str, key: &str, response: Response) {
        let mut inner = self.inner();
        let cached = CachedResponse::new(response);
        if let Err(e) = inner.insert(name, key, cached.clone()) {
            warn!(cache = name, key, error = %e, "Failed to persist cache entry");
            inner.insert_in_memory(name, key.to_string(), cached);
        }
    }

    /// Commit a batch under one lock so readers never see half of it.
    ///
    /// A generation that does not exist yet is written to a staging
    /// directory and renamed into place, so a crash never leaves half of it.
    pub fn put_all(&self, name: &str, entries: Vec<(String, Response)>) {
        let entries: Vec<(String, CachedResponse)> = entries
            .into_iter()
            .map(|(key, response)| (key, CachedResponse::new(response)))
            .collect();

        let mut inner = self.inner();
        let result = match (inner.position(name), inner.root.clone()) {
            (None, Some(root)) => inner.create_staged(&root, name, entries.clone()),
            _ => entries
                .iter()
                .try_for_each(|(key, cached)| inner.insert(name, key, cached.clone())),
        };

        if let Err(e) = result {
            warn!(cache = name, error = %e, "Failed to persist cache generation, keeping it in memory");
            for (key, cached) in entries {
                inner.insert_in_memory(name, key, cached);
            }
        }
    }

    /// First match across every generation.
    pub fn match_any(&self, key: &str) -> Option<CachedResponse> {
        self.match_except(key, None)
    }

    /// First match across every generation except `skip`.
    pub fn match_except(&self, key: &str, skip: Option<&str>) -> Option<CachedResponse> {
        self.inner()
            .generations
            .iter()
            .filter(|g| Some(g.name.as_str()) != skip)
            .find_map(|g| g.entries.get(key).map(|entry| entry.cached.clone()))
    }

    pub fn delete(&self, name: &str) -> bool {
        let mut inner = self.inner();
        let Some(index) = inner.position(name) else {
            return false;
        };
        inner.remove(index);
        if let Err(e) = inner.write_index() {
            warn!(error = %e, "Failed to update cache index");
        }
        true
    }

    /// Delete every generation whose name is not in `keep`; returns the deleted names.
    pub fn retain_only(&self, keep: &[&str]) -> Vec<String> {
        let mut inner = self.inner();
        let mut deleted = Vec::new();
        let mut index = 0;
        while index < inner.generations.len() {
            if keep.contains(&inner.generations[index].name.as_str()) {
                index += 1;
            } else {
                deleted.push(inner.remove(index).name);
            }
        }
        if !deleted.is_empty() {
            if let Err(e) = inner.write_index() {
                warn!(error = %e, "Failed to update cache index");
            }
        }
        deleted
    }

    /// Delete every generation; returns how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner();
        let count = inner.generations.len();
        while !inner.generations.is_empty() {
            inner.remove(0);
        }
        if let Err(e) = inner.write_index() {
            warn!(error = %e, "Failed to update cache index");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_replaces_never_merges() {
        let storage = CacheStorage::new();
        storage.put("data-v1", "/api/data", Response::ok("first"));
        storage.put("data-v1", "/api/data", Response::ok("second"));
        assert_eq!(storage.len("data-v1"), 1);
        let cached = storage.get("data-v1", "/api/data").expect("entry");
        assert_eq!(cached.response.body, b"second");
        assert!(cached.age_minutes() <= 1);
    }

    #[test]
    fn test_match_any_searches_in_creation_order() {
        let storage = CacheStorage::new();
        storage.put("static-v1", "/index.html", Response::ok("old"));
        storage.put("static-v2", "/index.html", Response::ok("new"));
        let found = storage.match_any("/index.html").expect("match");
        assert_eq!(found.response.body, b"old");
        assert!(storage.match_any("/missing").is_none());
    }

    #[test]
    fn test_match_except_skips_named_generation() {
        let storage = CacheStorage::new();
        storage.put("data-v1", "/report.json", Response::ok("data"));
        assert!(storage.match_except("/report.json", Some("data-v1")).is_none());
        assert!(storage.match_except("/report.json", None).is_some());
    }

    #[test]
    fn test_retain_only_and_clear() {
        let storage = CacheStorage::new();
        for name in ["static-v1", "static-v2", "data-v1"] {
            storage.put(name, "/", Response::ok(""));
        }
        let deleted = storage.retain_only(&["static-v2", "data-v1"]);
        assert_eq!(deleted, vec!["static-v1".to_string()]);
        assert_eq!(storage.names(), vec!["static-v2".to_string(), "data-v1".to_string()]);

        assert!(storage.delete("data-v1"));
        assert!(!storage.delete("data-v1"));
        assert_eq!(storage.clear(), 1);
        assert!(storage.names().is_empty());
    }

    #[test]
    fn test_served_copy_is_marked_with_capture_time() {
        let cached = CachedResponse::new(Response::ok("{}"));
        let served = cached.served();
        assert_eq!(served.header(CACHE_STATUS_HEADER), Some("hit"));
        assert_eq!(
            served.header(CACHED_AT_HEADER),
            Some(cached.cached_at.timestamp_millis().to_string().as_str())
        );
        assert!(cached.response.header(CACHE_STATUS_HEADER).is_none());
    }

    #[test]
    fn test_generations_survive_reopen_in_order() {
        let dir = TempDir::new().expect("tempdir");
        let storage = CacheStorage::open(dir.path().to_path_buf()).expect("open");
        storage.put_all(
            "static-v1",
            vec![
                ("/".to_string(), Response::ok("home")),
                ("/css/style.css".to_string(), Response::ok("body{}")),
            ],
        );
        let mut with_header = Response::ok(r#"{"courses":[]}"#);
        with_header
            .headers
            .insert("last-modified", HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        storage.put("data-v1", "/api/data", with_header.clone());
        storage.put("data-v1", "/api/data", with_header.clone());

        let reopened = CacheStorage::open(dir.path().to_path_buf()).expect("reopen");
        assert_eq!(reopened.names(), vec!["static-v1".to_string(), "data-v1".to_string()]);
        assert_eq!(reopened.len("static-v1"), 2);
        assert_eq!(reopened.len("data-v1"), 1);
        let data = reopened.get("data-v1", "/api/data").expect("data");
        assert_eq!(data.response, with_header);
        assert_eq!(
            data.cached_at,
            storage.get("data-v1", "/api/data").expect("data").cached_at
        );
    }

    #[test]
    fn test_deletes_reach_disk() {
        let dir = TempDir::new().expect("tempdir");
        let storage = CacheStorage::open(dir.path().to_path_buf()).expect("open");
        for name in ["static-v0", "static-v1", "data-v1"] {
            storage.put(name, "/", Response::ok(""));
        }
        storage.retain_only(&["static-v1", "data-v1"]);
        assert!(!dir.path().join("static-v0").exists());

        storage.delete("data-v1");
        let reopened = CacheStorage::open(dir.path().to_path_buf()).expect("reopen");
        assert_eq!(reopened.names(), vec!["static-v1".to_string()]);

        assert_eq!(reopened.clear(), 1);
        let reopened = CacheStorage::open(dir.path().to_path_buf()).expect("reopen");
        assert!(reopened.names().is_empty());
    }

    #[test]
    fn test_leftover_staging_and_corrupt_entries_are_ignored() {
        let dir = TempDir::new().expect("tempdir");
        let storage = CacheStorage::open(dir.path().to_path_buf()).expect("open");
        storage.put_all("static-v1", vec![("/".to_string(), Response::ok("home"))]);

        std::fs::create_dir(dir.path().join(".staging-dead")).expect("staging");
        std::fs::write(dir.path().join("static-v1").join("junk.json"), "{oops").expect("junk");

        let reopened = CacheStorage::open(dir.path().to_path_buf()).expect("reopen");
        assert_eq!(reopened.len("static-v1"), 1);
        assert!(!dir.path().join(".staging-dead").exists());
    }
}
