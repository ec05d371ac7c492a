//! The in-memory view of all collections that the UI reads.
//!
//! The current `Snapshot` sits behind one `Arc`, swapped under a write lock
//! that is also held while the snapshot is persisted. Readers clone the
//! `Arc` and therefore always see one whole snapshot.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::models::{
    default_snapshot, validate_records, CollectionName, Collections, LogicalTimestamp, Record,
    Snapshot,
};
use crate::store::{ContextId, StorageScope, DATA_KEY, LAST_SYNC_KEY};

/// Result of an install attempt.
#[derive(Debug, Clone)]
pub struct Install {
    /// False when the candidate was older than what is already held.
    pub applied: bool,
    /// True when the visible collections differ from before.
    pub changed: bool,
    pub snapshot: Arc<Snapshot>,
}

/// Stored blob; a missing collection keeps the in-memory one.
#[derive(Debug, Deserialize)]
struct StoredCollections {
    courses: Option<Vec<Record>>,
    pricing: Option<Vec<Record>>,
    internships: Option<Vec<Record>>,
}

pub struct CollectionStore {
    current: RwLock<Arc<Snapshot>>,
    scope: StorageScope,
    context: ContextId,
}

impl CollectionStore {
    /// Starts empty at the epoch until the fallback chain installs something.
    pub fn new(scope: StorageScope, context: ContextId) -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::default())),
            scope,
            context,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arc<Snapshot>> {
        self.current.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<Snapshot>> {
        self.current.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn scope(&self) -> &StorageScope {
        &self.scope
    }

    pub fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.read())
    }

    pub fn collection(&self, name: CollectionName) -> Vec<Record> {
        self.read().get(name).to_vec()
    }

    pub fn courses(&self) -> Vec<Record> {
        self.collection(CollectionName::Courses)
    }

    pub fn pricing(&self) -> Vec<Record> {
        self.collection(CollectionName::Pricing)
    }

    pub fn internships(&self) -> Vec<Record> {
        self.collection(CollectionName::Internships)
    }

    pub fn last_sync_time(&self) -> LogicalTimestamp {
        self.read().last_sync_time
    }

    fn persist(&self, snapshot: &Snapshot) -> Result<(), SyncError> {
        let blob = serde_json::to_string(&snapshot.collections).map_err(SyncError::store)?;
        self.scope.set(self.context, DATA_KEY, &blob)?;
        self.scope.set(
            self.context,
            LAST_SYNC_KEY,
            &snapshot.last_sync_time.to_string(),
        )
    }

    /// Swap in `snapshot` unless it is older than the current one.
    fn install(&self, snapshot: Snapshot, persist: bool) -> Install {
        let mut current = self.write();
        if snapshot.last_sync_time < current.last_sync_time {
            debug!(
                candidate = %snapshot.last_sync_time,
                held = %current.last_sync_time,
                "Ignoring older snapshot"
            );
            return Install {
                applied: false,
                changed: false,
                snapshot: Arc::clone(&current),
            };
        }

        let changed = !current.same_content(&snapshot);
        if persist {
            if let Err(e) = self.persist(&snapshot) {
                warn!(error = %e, "Failed to persist snapshot, keeping it in memory only");
            }
        }
        *current = Arc::new(snapshot);
        Install {
            applied: true,
            changed,
            snapshot: Arc::clone(&current),
        }
    }

    /// Install a snapshot fetched by the sync engine and persist it in the same step.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Install {
        self.install(snapshot, true)
    }

    /// Replace one collection locally.
    ///
    /// The store write happens first; if it fails the write is lost and the
    /// in-memory view is left untouched.
    pub fn replace(
        &self,
        name: CollectionName,
        records: Vec<Record>,
        timestamp: LogicalTimestamp,
    ) -> Result<Arc<Snapshot>, SyncError> {
        validate_records(name, &records)?;

        let mut current = self.write();
        let next = current.with_collection(name, records, timestamp.max(current.last_sync_time));
        self.persist(&next)?;
        *current = Arc::new(next);
        Ok(Arc::clone(&current))
    }

    /// Read the snapshot held in the local store, if any.
    pub fn load_from_local(&self) -> Result<Option<Snapshot>, SyncError> {
        let blob = match self.scope.get(DATA_KEY)? {
            Some(blob) => blob,
            None => return Ok(None),
        };

        let stored: StoredCollections = match serde_json::from_str(&blob) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Stored collections are unreadable, ignoring them");
                return Ok(None);
            }
        };

        let held = self.current();
        let collections = Collections {
            courses: stored.courses.unwrap_or_else(|| held.collections.courses.clone()),
            pricing: stored.pricing.unwrap_or_else(|| held.collections.pricing.clone()),
            internships: stored
                .internships
                .unwrap_or_else(|| held.collections.internships.clone()),
        };
        if let Err(e) = collections.validate() {
            warn!(error = %e, "Stored collections are invalid, ignoring them");
            return Ok(None);
        }

        let last_sync_time = self
            .scope
            .get(LAST_SYNC_KEY)?
            .as_deref()
            .and_then(LogicalTimestamp::parse)
            .unwrap_or(LogicalTimestamp::EPOCH);

        Ok(Some(Snapshot::new(collections, last_sync_time)))
    }

    /// Second tier: install whatever the local store holds.
    /// `Ok(None)` means the store is empty.
    pub fn install_from_local(&self) -> Result<Option<Install>, SyncError> {
        Ok(self
            .load_from_local()?
            .map(|snapshot| self.install(snapshot, false)))
    }

    /// Last tier. Defaults sit at the epoch, so they never displace real data.
    pub fn load_defaults(&self) -> Install {
        self.install(default_snapshot(), false)
    }

    /// Drop the in-memory view back to empty; used before a hard reload.
    pub fn reset(&self) {
        *self.write() = Arc::new(Snapshot::default());
    }
}
