//! Store configuration
//!
//! Stored as JSON at `<store root>/store-config.json`. A missing file means
//! defaults; unknown or missing fields fall back to their defaults too.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

const CONFIG_FILE: &str = "store-config.json";

/// Tuning knobs for the SQLite-backed store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum number of content ids bound into a single ledger statement.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// SQLite journal mode (ignored for in-memory stores).
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,
    #[serde(default = "default_synchronous")]
    pub synchronous: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Page cache size in KiB.
    #[serde(default = "default_cache_size_kib")]
    pub cache_size_kib: u64,
}

fn default_batch_size() -> usize {
    500
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}

fn default_synchronous() -> String {
    "NORMAL".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_cache_size_kib() -> u64 {
    64_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            journal_mode: default_journal_mode(),
            synchronous: default_synchronous(),
            busy_timeout_ms: default_busy_timeout_ms(),
            cache_size_kib: default_cache_size_kib(),
        }
    }
}

impl StoreConfig {
    /// Load the config from a store root, or defaults if none was saved.
    pub fn load(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let mut config: StoreConfig = serde_json::from_str(&data)?;
        if config.batch_size == 0 {
            tracing::warn!("batch_size of 0 in {:?}, using default", config_path);
            config.batch_size = default_batch_size();
        }
        Ok(config)
    }

    /// Save the config to a store root.
    pub fn save(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;
        let config_path = root.join(CONFIG_FILE);
        let tmp_path = config_path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp_path, &data)?;
        fs::rename(&tmp_path, &config_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_is_default() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(StoreConfig::load(tmp.path()).unwrap(), StoreConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let config = StoreConfig {
            batch_size: 7,
            synchronous: "FULL".into(),
            ..StoreConfig::default()
        };
        config.save(tmp.path()).unwrap();
        assert_eq!(StoreConfig::load(tmp.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), r#"{"batch_size": 64}"#).unwrap();
        let config = StoreConfig::load(tmp.path()).unwrap();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.journal_mode, "WAL");
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE), r#"{"batch_size": 0}"#).unwrap();
        assert_eq!(StoreConfig::load(tmp.path()).unwrap().batch_size, 500);
    }
}
