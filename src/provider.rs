//! Device providers: list devices per platform and hand out drivers.
//!
//! A provider holds at most one driver per serial for the life of the
//! process. Creation is guarded by a per-serial lock so concurrent requests
//! during attach end up sharing a single driver instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::IosConfigStore;
use crate::driver::android::{AdbDriver, AgentDriver};
use crate::driver::harmony::HarmonyDriver;
use crate::driver::ios::{IosDriver, ServerRegistry, TunnelManager};
use crate::driver::{android, harmony, ios, DynDriver};
use crate::error::DriverError;
use crate::model::{DeviceInfo, Platform};

/// Env switch selecting the plain bridge driver over the agent driver.
pub const USE_ADB_DRIVER_ENV: &str = "UIAUTODEV_USE_ADB_DRIVER";

#[async_trait]
pub trait Provider: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DriverError>;

    async fn get_device_driver(&self, serial: &str) -> Result<DynDriver, DriverError>;
}

/// Striped per-serial creation locks plus the published driver map.
struct DriverCache {
    drivers: StdMutex<HashMap<String, DynDriver>>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DriverCache {
    fn new() -> Self {
        Self {
            drivers: StdMutex::new(HashMap::new()),
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn get(&self, serial: &str) -> Option<DynDriver> {
        self.drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(serial)
            .cloned()
    }

    fn publish(&self, serial: &str, driver: DynDriver) {
        self.drivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(serial.to_string(), driver);
    }

    fn lock_for(&self, serial: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(serial.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

pub struct AndroidProvider {
    use_bridge_driver: bool,
    cache: DriverCache,
}

impl AndroidProvider {
    /// `use_bridge_driver` forces the shell-only path (no agent RPC).
    pub fn new(use_bridge_driver: bool) -> Self {
        Self {
            use_bridge_driver,
            cache: DriverCache::new(),
        }
    }

    /// Honor `UIAUTODEV_USE_ADB_DRIVER` ∈ {1, true, True}.
    pub fn from_env() -> Self {
        let use_bridge = matches!(
            std::env::var(USE_ADB_DRIVER_ENV).as_deref(),
            Ok("1") | Ok("true") | Ok("True")
        );
        Self::new(use_bridge)
    }
}

#[async_trait]
impl Provider for AndroidProvider {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DriverError> {
        android::adb::list_devices().await.map_err(DriverError::Other)
    }

    async fn get_device_driver(&self, serial: &str) -> Result<DynDriver, DriverError> {
        if let Some(driver) = self.cache.get(serial) {
            return Ok(driver);
        }
        let lock = self.cache.lock_for(serial);
        let _guard = lock.lock().await;
        if let Some(driver) = self.cache.get(serial) {
            return Ok(driver);
        }

        let driver: DynDriver = if self.use_bridge_driver {
            Arc::new(AdbDriver::new(serial))
        } else {
            Arc::new(AgentDriver::new(serial))
        };
        self.cache.publish(serial, Arc::clone(&driver));
        Ok(driver)
    }
}

pub struct IosProvider {
    /// Process-wide overrides applied to devices without their own config.
    wda_bundle_id: Option<String>,
    wda_port: Option<u16>,
    tunnel: Arc<TunnelManager>,
    config: Arc<IosConfigStore>,
    registry: Arc<ServerRegistry>,
    cache: DriverCache,
}

impl IosProvider {
    pub fn new(
        wda_bundle_id: Option<String>,
        wda_port: Option<u16>,
        tunnel: Arc<TunnelManager>,
        config: Arc<IosConfigStore>,
        registry: Arc<ServerRegistry>,
    ) -> Self {
        Self {
            wda_bundle_id,
            wda_port,
            tunnel,
            config,
            registry,
            cache: DriverCache::new(),
        }
    }
}

#[async_trait]
impl Provider for IosProvider {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DriverError> {
        ios::list_devices().await.map_err(DriverError::Other)
    }

    async fn get_device_driver(&self, serial: &str) -> Result<DynDriver, DriverError> {
        if let Some(driver) = self.cache.get(serial) {
            return Ok(driver);
        }
        let lock = self.cache.lock_for(serial);
        let _guard = lock.lock().await;
        if let Some(driver) = self.cache.get(serial) {
            return Ok(driver);
        }

        // First attach: make sure the device is actually there before the
        // supervisor starts spawning helpers for it.
        let known = self.list_devices().await?;
        if !known.iter().any(|d| d.serial == serial) {
            return Err(DriverError::DeviceNotFound(serial.to_string()));
        }

        let driver: DynDriver = Arc::new(
            IosDriver::new(
                serial,
                self.wda_bundle_id.clone(),
                self.wda_port,
                Arc::clone(&self.tunnel),
                Arc::clone(&self.config),
                &self.registry,
            )
            .await?,
        );
        self.cache.publish(serial, Arc::clone(&driver));
        Ok(driver)
    }
}

pub struct HarmonyProvider {
    cache: DriverCache,
}

impl HarmonyProvider {
    pub fn new() -> Self {
        Self {
            cache: DriverCache::new(),
        }
    }
}

impl Default for HarmonyProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for HarmonyProvider {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, DriverError> {
        harmony::list_devices().await.map_err(DriverError::Other)
    }

    async fn get_device_driver(&self, serial: &str) -> Result<DynDriver, DriverError> {
        if let Some(driver) = self.cache.get(serial) {
            return Ok(driver);
        }
        let lock = self.cache.lock_for(serial);
        let _guard = lock.lock().await;
        if let Some(driver) = self.cache.get(serial) {
            return Ok(driver);
        }

        let driver: DynDriver = Arc::new(HarmonyDriver::new(serial));
        self.cache.publish(serial, Arc::clone(&driver));
        Ok(driver)
    }
}

/// All providers plus the process-scope singletons they share.
pub struct Providers {
    pub android: Arc<AndroidProvider>,
    pub android_adb: Arc<AndroidProvider>,
    pub ios: Arc<IosProvider>,
    pub harmony: Arc<HarmonyProvider>,
    pub tunnel: Arc<TunnelManager>,
    pub registry: Arc<ServerRegistry>,
    pub ios_config: Arc<IosConfigStore>,
}

impl Providers {
    pub fn new(ios_config: Arc<IosConfigStore>) -> Self {
        let tunnel = Arc::new(TunnelManager::new());
        let registry = Arc::new(ServerRegistry::new());
        Self {
            android: Arc::new(AndroidProvider::from_env()),
            android_adb: Arc::new(AndroidProvider::new(true)),
            ios: Arc::new(IosProvider::new(
                None,
                None,
                Arc::clone(&tunnel),
                Arc::clone(&ios_config),
                Arc::clone(&registry),
            )),
            harmony: Arc::new(HarmonyProvider::new()),
            tunnel,
            registry,
            ios_config,
        }
    }

    pub fn for_platform(&self, platform: Platform) -> Arc<dyn Provider> {
        match platform {
            Platform::Android => Arc::clone(&self.android) as Arc<dyn Provider>,
            Platform::Ios => Arc::clone(&self.ios) as Arc<dyn Provider>,
            Platform::Harmony => Arc::clone(&self.harmony) as Arc<dyn Provider>,
        }
    }

    /// Shutdown order is the reverse of construction: servers close first
    /// (each releasing its tunnel reference), then the tunnels are reaped.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
        self.tunnel.cleanup().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_android_driver_created_once_under_concurrency() {
        let provider = Arc::new(AndroidProvider::new(true));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = Arc::clone(&provider);
            handles.push(tokio::spawn(async move {
                provider.get_device_driver("emulator-5554").await.unwrap()
            }));
        }
        let mut drivers = Vec::new();
        for handle in handles {
            drivers.push(handle.await.unwrap());
        }
        // Every caller observes the same instance.
        for pair in drivers.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn test_use_adb_driver_env_values() {
        std::env::set_var(USE_ADB_DRIVER_ENV, "true");
        let provider = AndroidProvider::from_env();
        assert!(provider.use_bridge_driver);
        std::env::set_var(USE_ADB_DRIVER_ENV, "0");
        let provider = AndroidProvider::from_env();
        assert!(!provider.use_bridge_driver);
        std::env::remove_var(USE_ADB_DRIVER_ENV);
    }
}
