use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::debug;

use super::KeyValueStore;

/// Extension for stored value files
const VALUE_EXTENSION: &str = "json";

/// File-backed store: each key is one file in the data directory.
///
/// Writes go to a temporary sibling and are renamed into place, so a crash
/// mid-write leaves the previous value intact.
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn value_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
        if !valid || key.starts_with('.') {
            bail!("Invalid storage key: {:?}", key);
        }
        Ok(self.data_dir.join(format!("{}.{}", key, VALUE_EXTENSION)))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.value_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read stored value: {}", key))?;
        Ok(Some(contents))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.value_path(key)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)
            .with_context(|| format!("Failed to write stored value: {}", key))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace stored value: {}", key))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.value_path(key)?;
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove stored value: {}", key))?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.data_dir)
            .with_context(|| format!("Failed to list data directory: {}", self.data_dir.display()))?;
        let mut removed = 0usize;
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(VALUE_EXTENSION) {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        debug!(removed, "Cleared file store");
        Ok(())
    }
}
