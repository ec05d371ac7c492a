use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::collection::{CollectionName, Collections, Record};

/// Milliseconds since the Unix epoch, used to order snapshots.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogicalTimestamp(u64);

impl LogicalTimestamp {
    pub const EPOCH: LogicalTimestamp = LogicalTimestamp(0);

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn is_epoch(&self) -> bool {
        self.0 == 0
    }

    /// The current time, or one past `self` if the clock has not moved on.
    pub fn next_after(self) -> Self {
        Self::now().max(Self(self.0.saturating_add(1)))
    }

    /// Parse the decimal form kept in the local store.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse::<u64>().ok().map(Self)
    }

    /// Parse an HTTP date such as a `Last-Modified` header.
    pub fn from_http_date(raw: &str) -> Option<Self> {
        DateTime::parse_from_rfc2822(raw.trim())
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc).timestamp_millis().max(0) as u64))
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.0 as i64)
    }
}

impl fmt::Display for LogicalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One consistent view of all collections at a point in logical time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub collections: Collections,
    pub last_sync_time: LogicalTimestamp,
}

impl Snapshot {
    pub fn new(collections: Collections, last_sync_time: LogicalTimestamp) -> Self {
        Self {
            collections,
            last_sync_time,
        }
    }

    /// A copy of this snapshot with one collection swapped out.
    pub fn with_collection(
        &self,
        name: CollectionName,
        records: Vec<Record>,
        last_sync_time: LogicalTimestamp,
    ) -> Self {
        let mut collections = self.collections.clone();
        collections.set(name, records);
        Self {
            collections,
            last_sync_time,
        }
    }

    pub fn get(&self, name: CollectionName) -> &[Record] {
        self.collections.get(name)
    }

    pub fn same_content(&self, other: &Snapshot) -> bool {
        self.collections == other.collections
    }
}
