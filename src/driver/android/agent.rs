//! Agent-backed Android driver.
//!
//! Talks JSON-RPC to the on-device automation agent over a bridge port
//! forward. The client is created lazily under a lock, is invalidated on
//! timeout or transport errors, and every agent operation falls back to the
//! bridge driver's helpers. The first render after attach never blocks on
//! agent init: until a client has been connected, screenshots and hierarchy
//! dumps go straight through the bridge.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::DynamicImage;
use serde_json::json;
use tokio::sync::Mutex;

use super::adb;
use super::adb_driver::AdbDriver;
use super::env_timeout_secs;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::hierarchy::parse_xml;
use crate::model::{AppInfo, CurrentApp, Node, Platform, WindowSize};

const RPC_TIMEOUT_ENV: &str = "UIAUTODEV_ANDROID_U2_RPC_TIMEOUT";
const DEFAULT_RPC_TIMEOUT: f64 = 15.0;

/// Device-side port the automation agent listens on.
const AGENT_DEVICE_PORT: u16 = 9008;
/// Default depth cap for hierarchy dumps.
const MAX_DUMP_DEPTH: u32 = 50;

#[derive(Clone)]
struct AgentClient {
    base_url: String,
    http: reqwest::Client,
}

impl AgentClient {
    async fn connect(serial: &str) -> Result<Self, DriverError> {
        let local = adb::forward(serial, 0, AGENT_DEVICE_PORT)
            .await
            .map_err(DriverError::Other)?;
        log::debug!(
            "agent rpc for {} forwarded to 127.0.0.1:{}",
            serial,
            local
        );
        Ok(Self {
            base_url: format!("http://127.0.0.1:{}/jsonrpc/0", local),
            http: reqwest::Client::new(),
        })
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, DriverError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.base_url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DriverError::HelperTimeout(format!(
                        "agent rpc {} exceeded {:?}",
                        method, timeout
                    ))
                } else {
                    DriverError::Other(anyhow::anyhow!("agent rpc {} failed: {}", method, e))
                }
            })?;

        let reply: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| DriverError::Other(anyhow::anyhow!("bad agent rpc reply: {}", e)))?;

        if let Some(error) = reply.get("error") {
            return Err(DriverError::Other(anyhow::anyhow!(
                "agent rpc {} returned error: {}",
                method,
                error
            )));
        }
        Ok(reply.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }
}

/// The agent driver delegates to the bridge driver's methods as named
/// helpers; inheritance collapses to composition.
pub struct AgentDriver {
    adb: AdbDriver,
    agent: Mutex<Option<AgentClient>>,
}

impl AgentDriver {
    pub fn new(serial: &str) -> Self {
        Self {
            adb: AdbDriver::new(serial),
            agent: Mutex::new(None),
        }
    }

    fn rpc_timeout() -> Duration {
        Duration::from_secs_f64(env_timeout_secs(RPC_TIMEOUT_ENV, DEFAULT_RPC_TIMEOUT))
    }

    /// Connect (once) under the lock and hand back a cheap clone.
    async fn ensure_agent(&self) -> Result<AgentClient, DriverError> {
        let mut slot = self.agent.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = AgentClient::connect(self.adb.serial()).await?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Snapshot the client without connecting; `None` until first use.
    async fn agent_if_connected(&self) -> Option<AgentClient> {
        self.agent.lock().await.clone()
    }

    /// Drop the client; the connection is in an unknown state after a
    /// timeout, so the next call reconnects from scratch.
    async fn invalidate_agent(&self) {
        let mut slot = self.agent.lock().await;
        if slot.take().is_some() {
            log::warn!("agent rpc client invalidated for {}", self.adb.serial());
        }
    }
}

#[async_trait]
impl Driver for AgentDriver {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn serial(&self) -> &str {
        self.adb.serial()
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        let client = self.ensure_agent().await?;
        match client
            .call("click", json!([x, y]), Self::rpc_timeout())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("agent tap failed, fallback to bridge: {}", e);
                self.invalidate_agent().await;
                self.adb.tap(x, y).await
            }
        }
    }

    async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration: f64,
    ) -> Result<(), DriverError> {
        let client = self.ensure_agent().await?;
        // The agent counts swipe time in ~5 ms injection steps.
        let steps = ((duration * 200.0).round() as i64).max(1);
        match client
            .call(
                "swipe",
                json!([start_x, start_y, end_x, end_y, steps]),
                Self::rpc_timeout(),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                log::warn!("agent swipe failed, fallback to bridge: {}", e);
                self.invalidate_agent().await;
                self.adb
                    .swipe(start_x, start_y, end_x, end_y, duration)
                    .await
            }
        }
    }

    async fn window_size(&self) -> Result<WindowSize, DriverError> {
        self.adb.window_size().await
    }

    async fn screenshot(&self) -> Result<DynamicImage, DriverError> {
        // Never block the first render on agent init.
        let client = match self.agent_if_connected().await {
            Some(c) => c,
            None => return self.adb.screenshot_bridge().await,
        };

        match client
            .call("takeScreenshot", json!([1, 80]), Self::rpc_timeout())
            .await
        {
            Ok(serde_json::Value::String(b64)) if !b64.is_empty() => {
                match base64::engine::general_purpose::STANDARD.decode(&b64) {
                    Ok(jpg) => match image::load_from_memory(&jpg) {
                        Ok(img) => return Ok(img),
                        Err(e) => log::warn!("agent screenshot undecodable: {}", e),
                    },
                    Err(e) => log::warn!("agent screenshot not base64: {}", e),
                }
                self.invalidate_agent().await;
                self.adb.screenshot_bridge().await
            }
            Ok(_) | Err(_) => {
                log::warn!("agent screenshot failed, fallback to bridge");
                self.invalidate_agent().await;
                self.adb.screenshot_bridge().await
            }
        }
    }

    async fn dump_hierarchy(&self) -> Result<(String, Node), DriverError> {
        // Same first-render rule as screenshots.
        let xml = match self.agent_if_connected().await {
            None => self.adb.dump_hierarchy_bridge().await?,
            Some(client) => {
                match client
                    .call(
                        "dumpWindowHierarchy",
                        json!([false, MAX_DUMP_DEPTH]),
                        Self::rpc_timeout(),
                    )
                    .await
                {
                    Ok(serde_json::Value::String(xml)) if !xml.is_empty() => xml,
                    Ok(_) | Err(_) => {
                        log::warn!("agent hierarchy dump failed, fallback to bridge");
                        self.invalidate_agent().await;
                        self.adb.dump_hierarchy_bridge().await?
                    }
                }
            }
        };

        let wsize = self.adb.window_size().await?;
        let tree = parse_xml(&xml, Platform::Android, wsize)?;
        Ok((xml, tree))
    }

    async fn home(&self) -> Result<(), DriverError> {
        self.adb.home().await
    }

    async fn back(&self) -> Result<(), DriverError> {
        self.adb.back().await
    }

    async fn app_switch(&self) -> Result<(), DriverError> {
        self.adb.app_switch().await
    }

    async fn volume_up(&self) -> Result<(), DriverError> {
        self.adb.volume_up().await
    }

    async fn volume_down(&self) -> Result<(), DriverError> {
        self.adb.volume_down().await
    }

    async fn volume_mute(&self) -> Result<(), DriverError> {
        self.adb.volume_mute().await
    }

    async fn wake_up(&self) -> Result<(), DriverError> {
        self.adb.wake_up().await
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        self.adb.send_keys(text).await
    }

    async fn clear_text(&self) -> Result<(), DriverError> {
        self.adb.clear_text().await
    }

    async fn app_install(&self, url: &str) -> Result<(), DriverError> {
        self.adb.app_install(url).await
    }

    async fn app_launch(&self, package: &str) -> Result<(), DriverError> {
        self.adb.app_launch(package).await
    }

    async fn app_terminate(&self, package: &str) -> Result<(), DriverError> {
        self.adb.app_terminate(package).await
    }

    async fn app_current(&self) -> Result<CurrentApp, DriverError> {
        self.adb.app_current().await
    }

    async fn app_list(&self) -> Result<Vec<AppInfo>, DriverError> {
        self.adb.app_list().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_starts_disconnected() {
        let driver = AgentDriver::new("emulator-5554");
        assert!(driver.agent_if_connected().await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_without_client_is_noop() {
        let driver = AgentDriver::new("emulator-5554");
        driver.invalidate_agent().await;
        assert!(driver.agent_if_connected().await.is_none());
    }

    #[test]
    fn test_rpc_timeout_env_override() {
        std::env::set_var(RPC_TIMEOUT_ENV, "3");
        assert_eq!(AgentDriver::rpc_timeout(), Duration::from_secs(3));
        std::env::remove_var(RPC_TIMEOUT_ENV);
        assert_eq!(AgentDriver::rpc_timeout(), Duration::from_secs(15));
    }
}
