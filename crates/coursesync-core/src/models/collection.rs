//! Collection records and the three-collection payload.
//!
//! Records are open-ended: apart from the caller-assigned `id`, every field
//! is kept as raw JSON so admin edits round-trip without loss.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::SyncError;

/// One of the named content collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionName {
    Courses,
    Pricing,
    Internships,
}

impl CollectionName {
    pub const ALL: [CollectionName; 3] = [
        CollectionName::Courses,
        CollectionName::Pricing,
        CollectionName::Internships,
    ];

    /// Name used in API paths and JSON payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectionName::Courses => "courses",
            CollectionName::Pricing => "pricing",
            CollectionName::Internships => "internships",
        }
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Unknown collection: {0}")]
pub struct UnknownCollection(pub String);

impl FromStr for CollectionName {
    type Err = UnknownCollection;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "courses" => Ok(CollectionName::Courses),
            "pricing" => Ok(CollectionName::Pricing),
            "internships" => Ok(CollectionName::Internships),
            _ => Err(UnknownCollection(s.to_string())),
        }
    }
}

/// A single entry in a collection, keyed by its caller-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: i64,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Display label: `title`, then `plan`, then the id.
    pub fn label(&self) -> String {
        ["title", "plan"]
            .iter()
            .find_map(|key| self.field(key).and_then(Value::as_str))
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

/// The full data payload: every collection in display order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collections {
    pub courses: Vec<Record>,
    pub pricing: Vec<Record>,
    pub internships: Vec<Record>,
}

impl Collections {
    pub fn get(&self, name: CollectionName) -> &[Record] {
        match name {
            CollectionName::Courses => &self.courses,
            CollectionName::Pricing => &self.pricing,
            CollectionName::Internships => &self.internships,
        }
    }

    pub fn set(&mut self, name: CollectionName, records: Vec<Record>) {
        match name {
            CollectionName::Courses => self.courses = records,
            CollectionName::Pricing => self.pricing = records,
            CollectionName::Internships => self.internships = records,
        }
    }

    /// Parse a payload and check id uniqueness.
    pub fn from_json(bytes: &[u8]) -> Result<Self, SyncError> {
        let collections: Collections = serde_json::from_slice(bytes)?;
        collections.validate()?;
        Ok(collections)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        for name in CollectionName::ALL {
            validate_records(name, self.get(name))?;
        }
        Ok(())
    }

    pub fn total_records(&self) -> usize {
        self.courses.len() + self.pricing.len() + self.internships.len()
    }
}

pub fn validate_records(name: CollectionName, records: &[Record]) -> Result<(), SyncError> {
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        if !seen.insert(record.id) {
            return Err(SyncError::MalformedResponse(format!(
                "duplicate id {} in {}",
                record.id, name
            )));
        }
    }
    Ok(())
}
