//! Persisted per-module live/capture policy.
//!
//! Loaded once at startup, rewritten on every accepted `data_config` SET.
//! Readers on the sample hot path only take a short read lock.

use crate::error::CoreResult;
use crate::fs;
use crate::messages::ModuleDataConfig;
use parking_lot::RwLock;
use std::path::PathBuf;
use tracing::{debug, warn};

pub struct DataConfigStore {
    path: PathBuf,
    config: RwLock<ModuleDataConfig>,
}

impl DataConfigStore {
    /// Load the stored policy; a missing or unreadable file falls back to
    /// defaults (capture enabled, live streams off).
    pub fn load(path: PathBuf) -> Self {
        let config = match fs::read_to_string_opt(&path) {
            Ok(Some(text)) => match serde_json::from_str(&text) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid data config, using defaults");
                    ModuleDataConfig::default()
                }
            },
            Ok(None) => ModuleDataConfig::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read data config");
                ModuleDataConfig::default()
            }
        };
        debug!(path = %path.display(), ?config, "data config loaded");
        Self {
            path,
            config: RwLock::new(config),
        }
    }

    pub fn get(&self) -> ModuleDataConfig {
        self.config.read().clone()
    }

    /// Apply and persist a new policy.
    pub fn store(&self, new_config: ModuleDataConfig) -> CoreResult<()> {
        let text = serde_json::to_string_pretty(&new_config)?;
        *self.config.write() = new_config;
        fs::write_string(&self.path, &text)
    }

    pub fn capture_enabled(&self) -> bool {
        self.config.read().enable_capturing
    }

    pub fn all_enabled(&self) -> bool {
        self.config.read().enable_live_all_samples
    }

    pub fn fixed_enabled(&self) -> bool {
        self.config.read().enable_live_fixed_rate
    }

    /// Decimation period in seconds; guards against a zero rate.
    pub fn fixed_delta_time(&self) -> f64 {
        let rate = self.config.read().live_rate_hz;
        if rate > 1e-4 {
            1.0 / rate as f64
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataConfigStore::load(dir.path().join("data_config.json"));
        assert!(store.capture_enabled());
        assert!(!store.all_enabled());
        assert_eq!(store.fixed_delta_time(), 1.0);
    }

    #[test]
    fn store_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_config.json");

        let store = DataConfigStore::load(path.clone());
        store
            .store(ModuleDataConfig {
                enable_capturing: false,
                enable_live_all_samples: true,
                enable_live_fixed_rate: true,
                live_rate_hz: 10.0,
            })
            .unwrap();

        let reloaded = DataConfigStore::load(path);
        assert!(!reloaded.capture_enabled());
        assert!(reloaded.all_enabled());
        assert!(reloaded.fixed_enabled());
        assert!((reloaded.fixed_delta_time() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn zero_rate_does_not_divide() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataConfigStore::load(dir.path().join("data_config.json"));
        store
            .store(ModuleDataConfig {
                live_rate_hz: 0.0,
                ..ModuleDataConfig::default()
            })
            .unwrap();
        assert_eq!(store.fixed_delta_time(), 1.0);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data_config.json");
        std::fs::write(&path, "not json").unwrap();
        let store = DataConfigStore::load(path);
        assert_eq!(store.get(), ModuleDataConfig::default());
    }
}
