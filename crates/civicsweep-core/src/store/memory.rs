use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;

use super::KeyValueStore;

/// In-memory store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // A panic while holding the lock cannot leave a half-written value
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.values().clear();
        Ok(())
    }
}
