use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use super::LocalStore;
use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: String,
    pub stored_at: DateTime<Utc>,
}

impl StoredValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            stored_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        let now = Utc::now();
        (now - self.stored_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        age_display(self.age_minutes())
    }
}

/// Human-readable age ("just now", "5m ago", "2h ago", "3d ago").
pub fn age_display(minutes: i64) -> String {
    if minutes < 1 {
        // Also covers clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// One JSON file per key under a client-scoped directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Result<Self, SyncError> {
        std::fs::create_dir_all(&dir).map_err(SyncError::store)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, SyncError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(SyncError::StoreUnavailable(format!("invalid key: {:?}", key)));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }

    fn load(&self, key: &str) -> Result<Option<StoredValue>, SyncError> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .map_err(|e| SyncError::StoreUnavailable(format!("failed to read {}: {}", key, e)))?;

        match serde_json::from_str::<StoredValue>(&contents) {
            Ok(stored) => Ok(Some(stored)),
            Err(e) => {
                // A torn or foreign file is treated as absent
                debug!(key, error = %e, "Ignoring unreadable store file");
                Ok(None)
            }
        }
    }
}

impl LocalStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.load(key)?.map(|stored| stored.value))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let path = self.key_path(key)?;
        let contents = serde_json::to_string_pretty(&StoredValue::new(value))
            .map_err(SyncError::store)?;

        // Each write gets its own temp file, then renames over the key, so
        // readers never see a partial file and concurrent writers never share one
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| SyncError::StoreUnavailable(format!("failed to write {}: {}", key, e)))?;
        tmp.write_all(contents.as_bytes())
            .map_err(|e| SyncError::StoreUnavailable(format!("failed to write {}: {}", key, e)))?;
        tmp.persist(&path).map_err(|e| {
            SyncError::StoreUnavailable(format!("failed to commit {}: {}", key, e.error))
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        let path = self.key_path(key)?;
        if path.exists() {
            std::fs::remove_file(&path).map_err(SyncError::store)?;
        }
        Ok(())
    }

    fn stored_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.load(key)?.map(|stored| stored.stored_at))
    }
}
