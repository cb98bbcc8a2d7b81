//! Bridge-level Android driver. Every operation goes through the platform
//! bridge's shell; the agent driver layers its RPC fast path on top of the
//! helpers exposed here.

use std::time::Duration;

use async_trait::async_trait;
use image::DynamicImage;
use regex::Regex;

use super::adb;
use super::env_timeout_secs;
use crate::driver::Driver;
use crate::error::DriverError;
use crate::hierarchy::parse_xml;
use crate::model::{AppInfo, CurrentApp, Node, Platform, WindowSize};

const SCREENSHOT_TIMEOUT_ENV: &str = "UIAUTODEV_ANDROID_SCREENSHOT_TIMEOUT";
const HIERARCHY_TIMEOUT_ENV: &str = "UIAUTODEV_ANDROID_HIERARCHY_TIMEOUT";
const DEFAULT_SCREENSHOT_TIMEOUT: f64 = 15.0;
const DEFAULT_HIERARCHY_TIMEOUT: f64 = 20.0;

/// On-device target of `uiautomator dump`.
const UIDUMP_TARGET: &str = "/data/local/tmp/uidump.xml";

pub struct AdbDriver {
    serial: String,
}

impl AdbDriver {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
        }
    }

    fn screenshot_timeout() -> Duration {
        Duration::from_secs_f64(env_timeout_secs(
            SCREENSHOT_TIMEOUT_ENV,
            DEFAULT_SCREENSHOT_TIMEOUT,
        ))
    }

    fn hierarchy_timeout() -> Duration {
        Duration::from_secs_f64(env_timeout_secs(
            HIERARCHY_TIMEOUT_ENV,
            DEFAULT_HIERARCHY_TIMEOUT,
        ))
    }

    /// Screencap via `exec-out`; on failure fall back to a shelled screencap
    /// into a device file pulled back over the bridge.
    pub async fn screenshot_bridge(&self) -> Result<DynamicImage, DriverError> {
        let timeout = Self::screenshot_timeout();
        match adb::exec_out_binary(&self.serial, "screencap -p", timeout).await {
            Ok(png) if !png.is_empty() => image::load_from_memory(&png)
                .map_err(|e| DriverError::Other(anyhow::anyhow!("bad screencap png: {}", e))),
            Ok(_) | Err(_) => {
                log::warn!("adb screencap failed, falling back to file pull");
                let target = "/data/local/tmp/byteautoui_screen.png";
                adb::shell(&self.serial, &format!("screencap -p {}", target), timeout)
                    .await
                    .map_err(DriverError::Other)?;
                let png = adb::read_device_file(&self.serial, target, timeout)
                    .await
                    .map_err(DriverError::Other)?;
                image::load_from_memory(&png)
                    .map_err(|e| DriverError::Other(anyhow::anyhow!("bad screencap png: {}", e)))
            }
        }
    }

    /// `uiautomator dump` to a fixed file, then pull it. When a concurrent
    /// agent kills the dump helper the command is retried once after reaping
    /// the agent's app_process.
    pub async fn dump_hierarchy_bridge(&self) -> Result<String, DriverError> {
        let timeout = Self::hierarchy_timeout();
        let cmd = format!(
            "rm -f {target}; uiautomator dump {target} && echo success",
            target = UIDUMP_TARGET
        );

        let mut last_error = String::new();
        for attempt in 0..2 {
            let output = match adb::shell(&self.serial, &cmd, timeout).await {
                Ok(out) => out,
                Err(e) => {
                    last_error = e.to_string();
                    if attempt == 0 && last_error.contains("Killed") {
                        self.kill_app_process().await;
                        continue;
                    }
                    return Err(DriverError::Other(anyhow::anyhow!(
                        "uiautomator dump failed: {}",
                        last_error
                    )));
                }
            };

            if output.contains("ERROR") || !output.contains("success") {
                last_error = output.trim().to_string();
                if attempt == 0 && last_error.contains("Killed") {
                    self.kill_app_process().await;
                    continue;
                }
                return Err(DriverError::Other(anyhow::anyhow!(
                    "uiautomator dump failed: {}",
                    last_error
                )));
            }

            let buf = adb::read_device_file(&self.serial, UIDUMP_TARGET, timeout)
                .await
                .map_err(DriverError::Other)?;
            let xml = String::from_utf8_lossy(&buf).to_string();
            if !xml.starts_with("<?xml") {
                return Err(DriverError::ParseError(format!(
                    "dump output is not xml: {:.100}",
                    xml
                )));
            }
            return Ok(xml);
        }

        Err(DriverError::Other(anyhow::anyhow!(
            "uiautomator dump failed after retry: {}",
            last_error
        )))
    }

    /// Reap stray `app_process` instances (the on-device agent) so the dump
    /// helper can grab the accessibility connection.
    async fn kill_app_process(&self) {
        log::debug!("killing app_process on {}", self.serial);
        let listing = adb::shell(&self.serial, "ps -A || ps", Duration::from_secs(10))
            .await
            .unwrap_or_default();
        let mut pids = Vec::new();
        for line in listing.lines() {
            if line.contains("app_process") {
                if let Some(pid) = line.split_whitespace().nth(1) {
                    pids.push(pid.to_string());
                }
            }
        }
        for pid in pids {
            let _ = adb::shell(
                &self.serial,
                &format!("kill {}", pid),
                Duration::from_secs(5),
            )
            .await;
        }
    }

    pub async fn current_activity(&self) -> Result<String, DriverError> {
        let output = adb::shell(
            &self.serial,
            "dumpsys activity activities",
            Duration::from_secs(5),
        )
        .await
        .map_err(DriverError::Other)?;
        let re = Regex::new(r"mResumedActivity:.*? ([\w\.]+/[\w\.]+)")
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(re
            .captures(&output)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default())
    }

    async fn app_version(&self, package: &str) -> (Option<String>, Option<i64>) {
        let output = adb::shell(
            &self.serial,
            &format!("dumpsys package {}", package),
            Duration::from_secs(10),
        )
        .await
        .unwrap_or_default();

        let version_name = Regex::new(r"versionName=(\S+)")
            .ok()
            .and_then(|re| re.captures(&output))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|v| v != "null");
        let version_code = Regex::new(r"versionCode=(\d+)")
            .ok()
            .and_then(|re| re.captures(&output))
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());
        (version_name, version_code)
    }

    pub async fn app_list_bridge(&self) -> Result<Vec<AppInfo>, DriverError> {
        let output = adb::shell(
            &self.serial,
            "pm list packages -3",
            Duration::from_secs(20),
        )
        .await
        .map_err(DriverError::Other)?;

        let mut results = Vec::new();
        for line in output.lines() {
            let package = match line.trim().strip_prefix("package:") {
                Some(p) if !p.is_empty() => p.to_string(),
                _ => continue,
            };
            let (version_name, version_code) = self.app_version(&package).await;
            results.push(AppInfo {
                package_name: package,
                version_name,
                version_code,
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl Driver for AdbDriver {
    fn platform(&self) -> Platform {
        Platform::Android
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        adb::shell(
            &self.serial,
            &format!("input tap {} {}", x, y),
            Duration::from_secs(10),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration: f64,
    ) -> Result<(), DriverError> {
        let millis = (duration * 1000.0).max(1.0) as u64;
        adb::shell(
            &self.serial,
            &format!(
                "input swipe {} {} {} {} {}",
                start_x, start_y, end_x, end_y, millis
            ),
            Duration::from_secs(10),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn window_size(&self) -> Result<WindowSize, DriverError> {
        adb::window_size(&self.serial).await.map_err(DriverError::Other)
    }

    async fn screenshot(&self) -> Result<DynamicImage, DriverError> {
        self.screenshot_bridge().await
    }

    async fn dump_hierarchy(&self) -> Result<(String, Node), DriverError> {
        let xml = self.dump_hierarchy_bridge().await?;
        let wsize = self.window_size().await?;
        let tree = parse_xml(&xml, Platform::Android, wsize)?;
        Ok((xml, tree))
    }

    async fn home(&self) -> Result<(), DriverError> {
        adb::keyevent(&self.serial, "HOME").await.map_err(DriverError::Other)
    }

    async fn back(&self) -> Result<(), DriverError> {
        adb::keyevent(&self.serial, "BACK").await.map_err(DriverError::Other)
    }

    async fn app_switch(&self) -> Result<(), DriverError> {
        adb::keyevent(&self.serial, "APP_SWITCH").await.map_err(DriverError::Other)
    }

    async fn volume_up(&self) -> Result<(), DriverError> {
        adb::keyevent(&self.serial, "VOLUME_UP").await.map_err(DriverError::Other)
    }

    async fn volume_down(&self) -> Result<(), DriverError> {
        adb::keyevent(&self.serial, "VOLUME_DOWN").await.map_err(DriverError::Other)
    }

    async fn volume_mute(&self) -> Result<(), DriverError> {
        adb::keyevent(&self.serial, "VOLUME_MUTE").await.map_err(DriverError::Other)
    }

    async fn wake_up(&self) -> Result<(), DriverError> {
        adb::keyevent(&self.serial, "WAKEUP").await.map_err(DriverError::Other)
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        // `input text` treats spaces as argument separators.
        let escaped = text.replace(' ', "%s").replace('\'', "\\'");
        adb::shell(
            &self.serial,
            &format!("input text '{}'", escaped),
            Duration::from_secs(10),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn clear_text(&self) -> Result<(), DriverError> {
        for _ in 0..3 {
            adb::shell(
                &self.serial,
                "input keyevent DEL --longpress",
                Duration::from_secs(10),
            )
            .await
            .map_err(DriverError::Other)?;
        }
        Ok(())
    }

    async fn app_install(&self, url: &str) -> Result<(), DriverError> {
        adb::install(&self.serial, url).await.map_err(DriverError::Other)
    }

    async fn app_launch(&self, package: &str) -> Result<(), DriverError> {
        let check = adb::shell(
            &self.serial,
            &format!("pm path {}", package),
            Duration::from_secs(10),
        )
        .await
        .map_err(DriverError::Other)?;
        if !check.contains("package:") {
            return Err(DriverError::InvalidArgument(format!(
                "app not installed: {}",
                package
            )));
        }
        adb::shell(
            &self.serial,
            &format!("monkey -p {} -c android.intent.category.LAUNCHER 1", package),
            Duration::from_secs(15),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn app_terminate(&self, package: &str) -> Result<(), DriverError> {
        adb::shell(
            &self.serial,
            &format!("am force-stop {}", package),
            Duration::from_secs(10),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn app_current(&self) -> Result<CurrentApp, DriverError> {
        let activity = self.current_activity().await?;
        let (package, activity_name) = match activity.split_once('/') {
            Some((p, a)) => (p.to_string(), Some(a.to_string())),
            None if !activity.is_empty() => (activity.clone(), None),
            None => {
                return Err(DriverError::Other(anyhow::anyhow!(
                    "no foreground activity found"
                )))
            }
        };
        Ok(CurrentApp {
            package,
            activity: activity_name,
            pid: None,
        })
    }

    async fn app_list(&self) -> Result<Vec<AppInfo>, DriverError> {
        self.app_list_bridge().await
    }
}
