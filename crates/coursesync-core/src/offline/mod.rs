//! Offline-serving cache at the network edge.
//!
//! This module provides the `OfflineCache` worker and the handle callers
//! use to reach it. The worker runs in its own task and owns the lifecycle
//! of named cache generations:
//!
//! - static assets are precached on install and served cache-first
//! - data responses are served network-first and cached on every 200
//! - a generation not named by the current configuration is deleted on
//!   activation, so bumping a name rebuilds that cache
//! - anything served from a generation carries a cache marker header
//!
//! Storage opened on a directory keeps the generations across restarts.

pub mod storage;
pub mod worker;

pub use storage::{CacheStorage, CachedResponse};
pub use worker::{CacheNames, OfflineCache, OfflineCacheHandle, WorkerState};
