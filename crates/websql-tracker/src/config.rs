//! Tracker configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Directory holding the catalog file and one subdirectory per origin
    pub database_directory: PathBuf,
    /// File name of the catalog inside `database_directory`
    #[serde(default = "default_tracker_file_name")]
    pub tracker_file_name: String,
    /// Quota reported for origins that have never been given one
    #[serde(default)]
    pub default_origin_quota: u64,
}

impl TrackerConfig {
    pub fn new(database_directory: PathBuf) -> Self {
        Self {
            database_directory,
            tracker_file_name: default_tracker_file_name(),
            default_origin_quota: 0,
        }
    }

    /// Read a JSON config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn tracker_database_path(&self) -> PathBuf {
        self.database_directory.join(&self.tracker_file_name)
    }

    /// Platform location for web databases, relative to the working
    /// directory when no home directory is known.
    pub fn data_dir() -> PathBuf {
        platform_data_root()
            .map(|root| root.join("WebSQL").join("Databases"))
            .unwrap_or_else(|| PathBuf::from(".websql").join("Databases"))
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new(Self::data_dir())
    }
}

fn default_tracker_file_name() -> String {
    "Databases.db".to_string()
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(target_os = "windows")]
fn platform_data_root() -> Option<PathBuf> {
    env_path("LOCALAPPDATA")
}

#[cfg(target_os = "macos")]
fn platform_data_root() -> Option<PathBuf> {
    env_path("HOME").map(|home| home.join("Library").join("Application Support"))
}

#[cfg(all(unix, not(target_os = "macos")))]
fn platform_data_root() -> Option<PathBuf> {
    env_path("XDG_DATA_HOME")
        .or_else(|| env_path("HOME").map(|home| home.join(".local").join("share")))
}

#[cfg(not(any(unix, target_os = "windows")))]
fn platform_data_root() -> Option<PathBuf> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, r#"{ "database_directory": "/var/lib/websql" }"#).unwrap();

        let config = TrackerConfig::load(&path).unwrap();
        assert_eq!(config.database_directory, PathBuf::from("/var/lib/websql"));
        assert_eq!(config.tracker_file_name, "Databases.db");
        assert_eq!(config.default_origin_quota, 0);
        assert_eq!(
            config.tracker_database_path(),
            PathBuf::from("/var/lib/websql/Databases.db")
        );
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tracker.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            TrackerConfig::load(&path),
            Err(crate::TrackerError::Config(_))
        ));
    }

    #[test]
    fn test_default_uses_platform_data_dir() {
        let config = TrackerConfig::default();
        assert!(config.database_directory.ends_with("Databases"));
        assert_eq!(config.database_directory, TrackerConfig::data_dir());
        assert!(config.tracker_database_path().ends_with("Databases/Databases.db"));
    }
}
