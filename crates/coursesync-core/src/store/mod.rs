//! Persistent client-side key/value storage.
//!
//! This module provides the `LocalStore` backends that survive restarts
//! (`FileStore`) or live for one process (`MemoryStore`), and the
//! `StorageScope` that every context of one client shares. Writes made
//! through a scope are broadcast so other contexts can react.
//!
//! Keys used by the sync engine:
//! - `techinternsData`: the collections blob
//! - `lastSyncTime`: logical timestamp of the stored blob
//! - `dataUpdated`: write marker, changed on every local write

pub mod file;
pub mod memory;
pub mod scope;

use chrono::{DateTime, Utc};

use crate::error::SyncError;

pub use file::{FileStore, StoredValue};
pub use memory::MemoryStore;
pub use scope::{ContextId, StorageEvent, StorageScope};

/// Full collections blob.
pub const DATA_KEY: &str = "techinternsData";

/// Logical timestamp of the stored blob, as decimal milliseconds.
pub const LAST_SYNC_KEY: &str = "lastSyncTime";

/// Marker whose change is the only cross-context trigger.
pub const MARKER_KEY: &str = "dataUpdated";

/// Durable key/value storage scoped to one client.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, SyncError>;

    fn set(&self, key: &str, value: &str) -> Result<(), SyncError>;

    fn remove(&self, key: &str) -> Result<(), SyncError>;

    /// When the value under `key` was last written, if the backend tracks it.
    fn stored_at(&self, _key: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        Ok(None)
    }
}
