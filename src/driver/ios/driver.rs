//! iOS driver: wraps the runner's HTTP client behind the normalized command
//! surface. Construction ensures the WDA chain is live and injects the MJPEG
//! tuning; element commands map 1:1 to runner endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use serde_json::json;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::IosConfigStore;
use crate::driver::ios::screenshot_stream::IosScreenshotStream;
use crate::driver::ios::tunnel::TunnelManager;
use crate::driver::ios::wda::{MjpegSettings, WdaClient};
use crate::driver::ios::wda_server::{ServerRegistry, WdaServer};
use crate::driver::Driver;
use crate::error::DriverError;
use crate::hierarchy::parse_xml;
use crate::model::{AppInfo, CurrentApp, Node, Platform, WindowSize};
use crate::supervisor::port_open;

pub struct IosDriver {
    serial: String,
    server: Arc<WdaServer>,
    client: WdaClient,
    /// Fallback MJPEG upstream for devices whose runner does not serve the
    /// MJPEG port.
    stream: Mutex<Option<Arc<IosScreenshotStream>>>,
    tunnel: Arc<TunnelManager>,
}

impl IosDriver {
    /// Bring up the WDA chain for this device and create the control
    /// session with MJPEG tuning.
    pub async fn new(
        serial: &str,
        wda_bundle_id: Option<String>,
        wda_port: Option<u16>,
        tunnel: Arc<TunnelManager>,
        config: Arc<IosConfigStore>,
        registry: &ServerRegistry,
    ) -> Result<Self, DriverError> {
        let server = WdaServer::new(
            serial,
            wda_bundle_id,
            wda_port,
            None,
            Arc::clone(&tunnel),
            config,
        );
        registry.register(Arc::clone(&server));
        Arc::clone(&server).start().await?;

        let client = WdaClient::new(server.wda_port);
        let driver = Self {
            serial: serial.to_string(),
            server,
            client,
            stream: Mutex::new(None),
            tunnel,
        };
        driver.init_session().await;
        Ok(driver)
    }

    /// Capabilities first, live settings second, untuned last.
    async fn init_session(&self) {
        let settings = MjpegSettings::default();
        let capabilities = json!({
            "alwaysMatch": serde_json::to_value(&settings).unwrap_or_default(),
        });
        match self.client.create_session(capabilities).await {
            Ok(_) => return,
            Err(e) => log::warn!(
                "capability session rejected for {}: {}, trying settings endpoint",
                self.serial,
                e
            ),
        }
        match self.client.apply_settings(&settings).await {
            Ok(()) => {}
            Err(e) => log::warn!(
                "mjpeg settings rejected for {}: {}, proceeding untuned",
                self.serial,
                e
            ),
        }
    }
}

#[async_trait]
impl Driver for IosDriver {
    fn platform(&self) -> Platform {
        Platform::Ios
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.client.tap(x, y).await.map_err(DriverError::Other)
    }

    async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration: f64,
    ) -> Result<(), DriverError> {
        self.client
            .swipe(start_x, start_y, end_x, end_y, duration)
            .await
            .map_err(DriverError::Other)
    }

    async fn window_size(&self) -> Result<WindowSize, DriverError> {
        self.client.window_size().await.map_err(DriverError::Other)
    }

    async fn screenshot(&self) -> Result<DynamicImage, DriverError> {
        let png = self.client.screenshot().await.map_err(DriverError::Other)?;
        image::load_from_memory(&png)
            .map_err(|e| DriverError::Other(anyhow::anyhow!("bad screenshot png: {}", e)))
    }

    async fn dump_hierarchy(&self) -> Result<(String, Node), DriverError> {
        let xml = self.client.source().await.map_err(DriverError::Other)?;
        let wsize = self.window_size().await?;
        let tree = parse_xml(&xml, Platform::Ios, wsize)?;
        Ok((xml, tree))
    }

    async fn home(&self) -> Result<(), DriverError> {
        self.client
            .press_button("home")
            .await
            .map_err(DriverError::Other)
    }

    async fn back(&self) -> Result<(), DriverError> {
        // No hardware back; the platform convention is an edge swipe.
        let wsize = self.window_size().await?;
        self.swipe(0, (wsize.height / 2) as i32, (wsize.width / 2) as i32, (wsize.height / 2) as i32, 0.3)
            .await
    }

    async fn app_switch(&self) -> Result<(), DriverError> {
        Err(DriverError::NotImplemented("appSwitch on ios".to_string()))
    }

    async fn volume_up(&self) -> Result<(), DriverError> {
        self.client
            .press_button("volumeUp")
            .await
            .map_err(DriverError::Other)
    }

    async fn volume_down(&self) -> Result<(), DriverError> {
        self.client
            .press_button("volumeDown")
            .await
            .map_err(DriverError::Other)
    }

    async fn volume_mute(&self) -> Result<(), DriverError> {
        Err(DriverError::NotImplemented("volumeMute on ios".to_string()))
    }

    async fn wake_up(&self) -> Result<(), DriverError> {
        self.client.unlock().await.map_err(DriverError::Other)
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        self.client.send_keys(text).await.map_err(DriverError::Other)
    }

    async fn clear_text(&self) -> Result<(), DriverError> {
        // Backspace burst into the focused element.
        let deletes = "\u{8}".repeat(30);
        self.client
            .send_keys(&deletes)
            .await
            .map_err(DriverError::Other)
    }

    async fn app_install(&self, url: &str) -> Result<(), DriverError> {
        let output = Command::new("ios")
            .args(["install", &format!("--path={}", url), &format!("--udid={}", self.serial)])
            .output()
            .await
            .map_err(|e| DriverError::Other(anyhow::anyhow!("failed to run ios install: {}", e)))?;
        if !output.status.success() {
            return Err(DriverError::Other(anyhow::anyhow!(
                "ios install failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn app_launch(&self, package: &str) -> Result<(), DriverError> {
        self.client
            .app_launch(package)
            .await
            .map_err(DriverError::Other)
    }

    async fn app_terminate(&self, package: &str) -> Result<(), DriverError> {
        self.client
            .app_terminate(package)
            .await
            .map_err(DriverError::Other)
    }

    async fn app_current(&self) -> Result<CurrentApp, DriverError> {
        let (bundle_id, pid) = self
            .client
            .active_app_info()
            .await
            .map_err(DriverError::Other)?;
        Ok(CurrentApp {
            package: bundle_id,
            activity: None,
            pid,
        })
    }

    async fn app_list(&self) -> Result<Vec<AppInfo>, DriverError> {
        let output = Command::new("ios")
            .args(["apps", "--udid", &self.serial])
            .output()
            .await
            .map_err(|e| DriverError::Other(anyhow::anyhow!("failed to run ios apps: {}", e)))?;
        if !output.status.success() {
            return Err(DriverError::Other(anyhow::anyhow!(
                "ios apps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let raw = String::from_utf8_lossy(&output.stdout);
        parse_app_listing(&raw)
    }

    /// The runner serves MJPEG through the forwarded port for its whole
    /// lifetime, so "starting" the stream is verifying reachability. When
    /// the port is silent the helper CLI's screenshot stream takes over.
    async fn start_mjpeg_stream(&self) -> Result<bool, DriverError> {
        if port_open(self.server.mjpeg_port, Duration::from_secs(1)).await {
            return Ok(true);
        }
        let stream = {
            let mut slot = self.stream.lock().await;
            slot.get_or_insert_with(|| {
                Arc::new(IosScreenshotStream::new(
                    &self.serial,
                    Arc::clone(&self.tunnel),
                    None,
                ))
            })
            .clone()
        };
        Ok(stream.start().await)
    }

    async fn stop_mjpeg_stream(&self) -> Result<bool, DriverError> {
        let stream = self.stream.lock().await.clone();
        match stream {
            // The runner's MJPEG server lives as long as the runner; only the
            // fallback stream is ours to stop.
            None => Ok(true),
            Some(stream) => Ok(stream.stop().await),
        }
    }

    async fn mjpeg_url(&self) -> Option<String> {
        if let Some(stream) = self.stream.lock().await.clone() {
            if stream.is_running().await {
                return stream.mjpeg_url().await;
            }
        }
        Some(format!("http://127.0.0.1:{}", self.server.mjpeg_port))
    }
}

/// `ios apps` prints one `bundleId name version` row per app (with a header
/// on some versions); keep whatever parses.
fn parse_app_listing(raw: &str) -> Result<Vec<AppInfo>, DriverError> {
    // Newer helper versions emit JSON.
    if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(raw) {
        let mut apps = Vec::new();
        for item in items {
            if let Some(bundle) = item
                .get("CFBundleIdentifier")
                .and_then(|v| v.as_str())
            {
                apps.push(AppInfo {
                    package_name: bundle.to_string(),
                    version_name: item
                        .get("CFBundleShortVersionString")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                    version_code: None,
                });
            }
        }
        return Ok(apps);
    }

    let mut apps = Vec::new();
    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        if let Some(first) = parts.next() {
            // Bundle ids are reverse-DNS; skip header/noise lines.
            if first.matches('.').count() >= 2 {
                apps.push(AppInfo {
                    package_name: first.to_string(),
                    version_name: parts.next_back().map(String::from),
                    version_code: None,
                });
            }
        }
    }
    Ok(apps)
}
