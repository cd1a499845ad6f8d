//! Application configuration management.
//!
//! This module handles loading and saving the engine configuration: the
//! service base URL, timing knobs, and the last identity used to sign in.
//!
//! Configuration is stored at `~/.config/civicsweep/config.json`.

use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::auth::Role;

/// Application name used for config/data directory paths
const APP_NAME: &str = "civicsweep";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_API_BASE_URL: &str = "http://localhost:4000/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Read-through cache lifetime for `fetch`, in seconds.
const DEFAULT_CACHE_MAX_AGE_SECS: i64 = 600;

/// Margin before token expiry after which a saved session is refused offline.
const DEFAULT_OFFLINE_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub cache_max_age_secs: i64,
    pub offline_skew_secs: i64,
    /// Overrides the platform data directory
    pub data_dir: Option<PathBuf>,
    pub last_login_id: Option<String>,
    pub last_role: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            cache_max_age_secs: DEFAULT_CACHE_MAX_AGE_SECS,
            offline_skew_secs: DEFAULT_OFFLINE_SKEW_SECS,
            data_dir: None,
            last_login_id: None,
            last_role: None,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Where the key-value store lives.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_max_age_secs)
    }

    pub fn offline_skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.offline_skew_secs)
    }

    /// Role and login id of the last online sign-in, if both are usable.
    pub fn last_identity(&self) -> Option<(Role, String)> {
        let role = self.last_role.as_deref()?.parse().ok()?;
        let login_id = self.last_login_id.as_deref()?.trim();
        if login_id.is_empty() {
            return None;
        }
        Some((role, login_id.to_string()))
    }

    pub fn remember_identity(&mut self, role: Role, login_id: &str) {
        self.last_role = Some(role.to_string());
        self.last_login_id = Some(login_id.trim().to_string());
    }
}
