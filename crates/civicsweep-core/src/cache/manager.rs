use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::store::{keys, load_json, save_json, KeyValueStore};

/// Default max age for cached query results.
pub const DEFAULT_MAX_AGE_MINUTES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub timestamp: DateTime<Utc>,
    pub value: Value,
}

impl CacheRecord {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            timestamp: Utc::now(),
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.timestamp
    }

    /// Inclusive bound: a record exactly `max_age` old is still fresh.
    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) <= max_age
    }
}

/// Rounded human-readable age: "just now", "5m ago", "2h ago", "3d ago".
/// Negative ages (clock skew) read as "just now".
pub fn age_display(age: Duration) -> String {
    match age.num_minutes() {
        m if m < 1 => "just now".to_string(),
        m if m < 60 => format!("{}m ago", m),
        m if m < 24 * 60 => format!("{}h ago", (m + 30) / 60),
        m => format!("{}d ago", (m + 12 * 60) / (24 * 60)),
    }
}

type RecordMap = BTreeMap<String, CacheRecord>;

/// TTL-bounded cache of remote query results, persisted as a single
/// key-to-record map in the store.
pub struct ResponseCache {
    store: Arc<dyn KeyValueStore>,
    default_max_age: Duration,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_max_age(store, Duration::minutes(DEFAULT_MAX_AGE_MINUTES))
    }

    pub fn with_max_age(store: Arc<dyn KeyValueStore>, default_max_age: Duration) -> Self {
        Self {
            store,
            default_max_age,
        }
    }

    pub fn default_max_age(&self) -> Duration {
        self.default_max_age
    }

    fn load(&self) -> RecordMap {
        match load_json::<RecordMap>(self.store.as_ref(), keys::CACHE) {
            Ok(records) => records.unwrap_or_default(),
            Err(e) => {
                // An unreadable cache is an empty cache
                debug!(error = %e, "Failed to load response cache");
                RecordMap::new()
            }
        }
    }

    fn save(&self, records: &RecordMap) -> Result<()> {
        save_json(self.store.as_ref(), keys::CACHE, records)
    }

    /// Cached value for `key` if it is no older than `max_age`
    /// (the default max age when `None`).
    pub fn get(&self, key: &str, max_age: Option<Duration>) -> Option<Value> {
        self.get_at(key, max_age, Utc::now())
    }

    pub(crate) fn get_at(&self, key: &str, max_age: Option<Duration>, now: DateTime<Utc>) -> Option<Value> {
        let max_age = max_age.unwrap_or(self.default_max_age);
        let record = self.get_any(key)?;
        if record.is_fresh(max_age, now) {
            Some(record.value)
        } else {
            debug!(cache_key = key, age_secs = record.age(now).num_seconds(), "Cache record expired");
            None
        }
    }

    /// Cached record for `key` regardless of age.
    pub fn get_any(&self, key: &str) -> Option<CacheRecord> {
        self.load().remove(key)
    }

    /// Store `value` under `key`, stamped with the current time.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_at(key, value, Utc::now())
    }

    pub(crate) fn set_at(&self, key: &str, value: Value, timestamp: DateTime<Utc>) -> Result<()> {
        let mut records = self.load();
        records.insert(key.to_string(), CacheRecord { timestamp, value });
        self.save(&records)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        let mut records = self.load();
        if records.remove(key).is_some() {
            self.save(&records)?;
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if let Err(e) = self.store.remove(keys::CACHE) {
            warn!(error = %e, "Failed to clear response cache");
            return Err(e);
        }
        Ok(())
    }

    /// Number of cached keys, fresh or not
    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
