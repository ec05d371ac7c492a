//! Offline-first synchronization of course, pricing and internship data.
//!
//! A [`SyncSession`] keeps a local copy of the server's collections in a
//! durable store, reconciles it with the server on a timer and on platform
//! signals, and tells every other context sharing the store when one of
//! them writes. An optional offline cache sits in front of the network so
//! reads keep working without connectivity.

pub mod api;
pub mod cache_buster;
pub mod channel;
pub mod collections;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod offline;
pub mod session;
pub mod store;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{FallbackTier, LoadOutcome, PropagateOutcome, SyncEngine, SyncState};
pub use error::SyncError;
pub use events::{PlatformSignal, SyncEvent, UpdateSource};
pub use models::{CollectionName, Collections, LogicalTimestamp, Record, Snapshot};
pub use session::{SessionStatus, SyncSession};
