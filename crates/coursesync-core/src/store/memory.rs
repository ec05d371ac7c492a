use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{LocalStore, StoredValue};
use crate::error::SyncError;

/// Process-lifetime store, optionally capped like a browser storage quota.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    quota_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push the total of keys and values past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes: Some(bytes),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, StoredValue>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError> {
        Ok(self.entries().get(key).map(|stored| stored.value.clone()))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError> {
        let mut entries = self.entries();
        if let Some(quota) = self.quota_bytes {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.value.len())
                .sum();
            let needed = others + key.len() + value.len();
            if needed > quota {
                return Err(SyncError::StoreUnavailable(format!(
                    "quota exceeded writing {} ({} > {} bytes)",
                    key, needed, quota
                )));
            }
        }
        entries.insert(key.to_string(), StoredValue::new(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SyncError> {
        self.entries().remove(key);
        Ok(())
    }

    fn stored_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(self.entries().get(key).map(|stored| stored.stored_at))
    }
}
