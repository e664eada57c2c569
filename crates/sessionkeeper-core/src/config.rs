//! Session configuration management.
//!
//! This module handles loading and saving the session configuration, which
//! covers storage naming, payload limits, refresh timing, and the refresh
//! endpoint.
//!
//! Configuration is stored at `~/.config/sessionkeeper/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application name used for config/storage directory paths
pub const APP_NAME: &str = "sessionkeeper";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Namespace prepended to every storage key.
    pub storage_prefix: String,
    /// Envelope version written by this release.
    pub storage_version: String,
    /// Older envelope versions that are migrated on read.
    pub legacy_versions: Vec<String>,
    /// Logical name of the credential entry.
    pub logical_key: String,
    /// Ceiling on the size of a stored envelope. Guards storage growth only.
    pub max_payload_bytes: usize,
    /// Refresh proactively when this close to expiry.
    pub refresh_window_secs: u64,
    /// Emit an expiry warning this long before expiry.
    pub warning_lead_secs: u64,
    /// Shortest credential lifetime the issuer hands out.
    pub min_issued_lifetime_secs: u64,
    pub max_refresh_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub refresh_url: String,
    pub request_timeout_secs: u64,
    /// Salt for passphrase-derived vault keys. Must be at least 8 bytes.
    pub key_salt: String,
    pub keyring_service: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            storage_prefix: "dpc.session.".to_string(),
            storage_version: "v2".to_string(),
            legacy_versions: vec!["v1".to_string()],
            logical_key: "credential".to_string(),
            max_payload_bytes: 8192,
            refresh_window_secs: 300,
            warning_lead_secs: 120,
            min_issued_lifetime_secs: 900,
            max_refresh_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 8000,
            refresh_url: "http://localhost:8000/api/v1/auth/refresh".to_string(),
            request_timeout_secs: 30,
            key_salt: "dpc-session-vault".to_string(),
            keyring_service: APP_NAME.to_string(),
        }
    }
}

impl SessionConfig {
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents).context("Failed to parse config file")?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.validate()?;
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check the cross-field invariants the session lifecycle relies on.
    ///
    /// A refresh window at or beyond the shortest issued lifetime would mark
    /// every fresh credential as due for refresh, so it is rejected here
    /// rather than discovered as a refresh storm.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_prefix.is_empty() {
            return Err(ConfigError::Empty("storage_prefix"));
        }
        if self.storage_version.is_empty() {
            return Err(ConfigError::Empty("storage_version"));
        }
        if self.logical_key.is_empty() {
            return Err(ConfigError::Empty("logical_key"));
        }
        if self.refresh_url.is_empty() {
            return Err(ConfigError::Empty("refresh_url"));
        }
        if self.legacy_versions.iter().any(|v| *v == self.storage_version) {
            return Err(ConfigError::VersionConflict(self.storage_version.clone()));
        }
        if self.max_payload_bytes == 0 {
            return Err(ConfigError::Zero("max_payload_bytes"));
        }
        if self.max_refresh_attempts == 0 {
            return Err(ConfigError::Zero("max_refresh_attempts"));
        }
        if self.min_issued_lifetime_secs == 0 {
            return Err(ConfigError::Zero("min_issued_lifetime_secs"));
        }
        if self.refresh_window_secs >= self.min_issued_lifetime_secs {
            return Err(ConfigError::RefreshWindowTooLarge {
                window: self.refresh_window_secs,
                lifetime: self.min_issued_lifetime_secs,
            });
        }
        if self.warning_lead_secs >= self.min_issued_lifetime_secs {
            return Err(ConfigError::WarningLeadTooLarge {
                lead: self.warning_lead_secs,
                lifetime: self.min_issued_lifetime_secs,
            });
        }
        Ok(())
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms.max(self.initial_backoff_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory used by file-backed session storage.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}
