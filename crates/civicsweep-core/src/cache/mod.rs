//! Local read cache for offline data access.
//!
//! This module provides the `ResponseCache` for storing remote query results
//! under caller-supplied cache keys. A record is a hit while its age is at
//! most the requested max age (10 minutes unless overridden); older records
//! are treated exactly like missing ones. The network gateway bypasses the
//! age check when it falls back to cached data while offline.

pub mod manager;

pub use manager::{age_display, CacheRecord, ResponseCache};
