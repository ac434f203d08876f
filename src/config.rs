//! Application configuration
//!
//! Loads and saves the front-end's own settings (rclone path, cache
//! directory, last-used options) as a JSON file in the user's home
//! directory, so preferences persist between sessions. Loading is
//! tolerant: a missing or corrupt file yields defaults, and a stored
//! rclone path that no longer exists is dropped so discovery runs again.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::manager::TransferOptions;
use crate::rclone::MountOptions;

/// Config file name in the user's home directory
pub const CONFIG_FILE_NAME: &str = ".rclone-manager.json";

/// Persisted application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Explicit path to the rclone executable
    pub rclone_path: Option<PathBuf>,
    /// VFS cache directory used for mounts and cache cleaning
    pub cache_dir: Option<PathBuf>,
    /// Last-used transfer options
    pub last_transfer: Option<TransferOptions>,
    /// Last-used mount options
    pub last_mount: Option<MountOptions>,
}

impl AppConfig {
    /// Default location: `~/.rclone-manager.json`
    pub fn default_path() -> Result<PathBuf> {
        dirs::home_dir()
            .context("Could not find home directory")
            .map(|home| home.join(CONFIG_FILE_NAME))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Ok(path) => Self::load_from(&path),
            Err(_) => Self::default(),
        }
    }

    /// Load from a specific file, falling back to defaults on any error.
    pub fn load_from(path: &Path) -> Self {
        let mut config: AppConfig = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();

        // A saved rclone path may have been uninstalled since.
        if let Some(ref rclone_path) = config.rclone_path {
            if !rclone_path.exists() {
                tracing::warn!("stored rclone path {:?} no longer exists, ignoring", rclone_path);
                config.rclone_path = None;
            }
        }

        config
    }

    /// Save to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    /// Save to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write config: {:?}", path))
    }

    /// Effective cache directory: configured, or `~/.rclone-cache`.
    pub fn effective_cache_dir(&self) -> Option<PathBuf> {
        self.cache_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".rclone-cache")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = AppConfig::load_from(Path::new("/no/such/config.json"));
        assert!(config.rclone_path.is_none());
        assert!(config.last_transfer.is_none());
    }

    #[test]
    fn test_corrupt_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = AppConfig::load_from(&path);
        assert!(config.rclone_path.is_none());
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let rclone = dir.path().join("rclone");
        std::fs::write(&rclone, "").unwrap();

        let config = AppConfig {
            rclone_path: Some(rclone.clone()),
            cache_dir: Some(PathBuf::from("/tmp/cache")),
            last_transfer: Some(TransferOptions {
                transfers: Some(8),
                dry_run: true,
                ..Default::default()
            }),
            last_mount: None,
        };
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert_eq!(loaded.rclone_path, Some(rclone));
        assert_eq!(loaded.cache_dir, Some(PathBuf::from("/tmp/cache")));
        let transfer = loaded.last_transfer.unwrap();
        assert_eq!(transfer.transfers, Some(8));
        assert!(transfer.dry_run);
    }

    #[test]
    fn test_stale_rclone_path_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = AppConfig {
            rclone_path: Some(PathBuf::from("/uninstalled/rclone")),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path);
        assert!(loaded.rclone_path.is_none());
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"theme":"flatly","cache_dir":"/tmp/c"}"#).unwrap();

        let config = AppConfig::load_from(&path);
        assert_eq!(config.cache_dir, Some(PathBuf::from("/tmp/c")));
    }
}
