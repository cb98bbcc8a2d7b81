//! Durable per-device configuration (`~/.byteautoui/ios_config.json`).
//!
//! Reads are served from an in-memory cache; writes atomically replace the
//! file and update the cache. Getters fall back to defaults for unknown
//! UDIDs. Single-process only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_WDA_BUNDLE_ID: &str = "com.facebook.WebDriverAgentRunner.xctrunner";
pub const DEFAULT_WDA_PORT: u16 = 8100;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wda_bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wda_port: Option<u16>,
}

/// Process-scope store, constructed once at startup and shared via `Arc`.
pub struct IosConfigStore {
    config_file: PathBuf,
    cache: Mutex<HashMap<String, DeviceConfig>>,
}

impl IosConfigStore {
    /// Open (or create) the store under `~/.byteautoui`.
    pub fn open_default() -> Result<Self> {
        let dir = dirs::home_dir()
            .context("cannot determine home directory")?
            .join(".byteautoui");
        Self::open(dir)
    }

    pub fn open(config_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed to create {}", config_dir.display()))?;
        let config_file = config_dir.join("ios_config.json");

        let cache = match std::fs::read_to_string(&config_file) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    log::warn!(
                        "failed to parse {}: {}, starting with empty config",
                        config_file.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            config_file,
            cache: Mutex::new(cache),
        })
    }

    pub fn wda_bundle_id(&self, udid: &str) -> String {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(udid)
            .and_then(|c| c.wda_bundle_id.clone())
            .unwrap_or_else(|| DEFAULT_WDA_BUNDLE_ID.to_string())
    }

    pub fn wda_port(&self, udid: &str) -> u16 {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .get(udid)
            .and_then(|c| c.wda_port)
            .unwrap_or(DEFAULT_WDA_PORT)
    }

    pub fn device_config(&self, udid: &str) -> (String, u16) {
        (self.wda_bundle_id(udid), self.wda_port(udid))
    }

    pub fn set_wda_bundle_id(&self, udid: &str, bundle_id: &str) -> Result<()> {
        self.mutate(udid, |c| c.wda_bundle_id = Some(bundle_id.to_string()))?;
        log::info!("saved WDA bundle id for {}: {}", short_udid(udid), bundle_id);
        Ok(())
    }

    pub fn set_wda_port(&self, udid: &str, port: u16) -> Result<()> {
        self.mutate(udid, |c| c.wda_port = Some(port))?;
        log::info!("saved WDA port for {}: {}", short_udid(udid), port);
        Ok(())
    }

    pub fn clear_device(&self, udid: &str) -> Result<()> {
        let snapshot = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.remove(udid);
            cache.clone()
        };
        self.persist(&snapshot)
    }

    pub fn all(&self) -> HashMap<String, DeviceConfig> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn mutate(&self, udid: &str, f: impl FnOnce(&mut DeviceConfig)) -> Result<()> {
        let snapshot = {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            f(cache.entry(udid.to_string()).or_default());
            cache.clone()
        };
        self.persist(&snapshot)
    }

    /// Write-through: write a temp file next to the target, then rename.
    fn persist(&self, snapshot: &HashMap<String, DeviceConfig>) -> Result<()> {
        let raw = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.config_file.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.config_file)
            .with_context(|| format!("failed to replace {}", self.config_file.display()))?;
        Ok(())
    }
}

/// First 8 characters of a UDID, for log lines.
pub fn short_udid(udid: &str) -> &str {
    &udid[..udid.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_unknown_udid() {
        let dir = tempfile::tempdir().unwrap();
        let store = IosConfigStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.wda_bundle_id("unknown"), DEFAULT_WDA_BUNDLE_ID);
        assert_eq!(store.wda_port("unknown"), 8100);
    }

    #[test]
    fn test_write_through_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = IosConfigStore::open(dir.path().to_path_buf()).unwrap();
            store.set_wda_bundle_id("00008110-AAAA", "com.example.wda").unwrap();
            store.set_wda_port("00008110-AAAA", 8200).unwrap();
            assert_eq!(store.wda_bundle_id("00008110-AAAA"), "com.example.wda");
        }
        // A fresh store reflects the last successful write.
        let store = IosConfigStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.wda_bundle_id("00008110-AAAA"), "com.example.wda");
        assert_eq!(store.wda_port("00008110-AAAA"), 8200);
    }

    #[test]
    fn test_clear_device() {
        let dir = tempfile::tempdir().unwrap();
        let store = IosConfigStore::open(dir.path().to_path_buf()).unwrap();
        store.set_wda_port("u1", 9000).unwrap();
        store.clear_device("u1").unwrap();
        assert_eq!(store.wda_port("u1"), DEFAULT_WDA_PORT);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ios_config.json"), "{oops").unwrap();
        let store = IosConfigStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.wda_bundle_id("x"), DEFAULT_WDA_BUNDLE_ID);
    }

    #[test]
    fn test_short_udid() {
        assert_eq!(short_udid("0123456789abcdef"), "01234567");
        assert_eq!(short_udid("abc"), "abc");
    }
}
