//! Client for the content server's REST API.
//!
//! This module provides the `ApiClient` used by the sync engine:
//! - `GET {api}/data` for the full payload
//! - `PUT {api}/<collection>` for one full-replacement write
//! - an optional legacy `POST` mirror of the whole payload
//!
//! Requests go through whatever `Transport` stack the session assembled,
//! so reads are cache-busted and can be answered by the offline cache.
//! A cache-answered read is flagged on the returned `FetchedSnapshot`.

pub mod client;

pub use client::{ApiClient, FetchedSnapshot};
