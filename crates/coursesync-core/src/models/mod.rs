//! Data models for synchronized content.
//!
//! - `Record`, `Collections`, `CollectionName`: the course, pricing and
//!   internship collections as served by `GET /api/data`
//! - `Snapshot`, `LogicalTimestamp`: one consistent, ordered view of all
//!   collections
//! - `defaults`: compiled-in content for the last fallback tier

pub mod collection;
pub mod defaults;
pub mod snapshot;

pub use collection::{validate_records, CollectionName, Collections, Record, UnknownCollection};
pub use defaults::default_snapshot;
pub use snapshot::{LogicalTimestamp, Snapshot};
