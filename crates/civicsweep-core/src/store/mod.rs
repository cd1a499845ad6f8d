//! Durable key-value storage.
//!
//! Every other component persists through a `KeyValueStore`. Values are
//! whole strings (usually JSON); there are no field-level updates, so
//! components that own disjoint key namespaces never need to coordinate.
//!
//! - `FileStore`: one file per key under the data directory
//! - `MemoryStore`: process-local map, used for tests and ephemeral runs

pub mod file;
pub mod keys;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Persistent string-keyed storage.
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key.
    fn clear(&self) -> Result<()>;
}

/// Load and deserialize a JSON value stored under `key`.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Result<Option<T>> {
    match store.get(key)? {
        Some(raw) => {
            let value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse stored value: {}", key))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize `value` as JSON and store it under `key`.
pub fn save_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> Result<()> {
    let contents = serde_json::to_string(value)
        .with_context(|| format!("Failed to serialize value for: {}", key))?;
    store.set(key, &contents)
}
