//! iOS support: helper-process supervision (tunnel, runner, forwards) and the
//! driver that talks to the on-device runner.

pub mod driver;
pub mod screenshot_stream;
pub mod tunnel;
pub mod wda;
pub mod wda_server;

pub use driver::IosDriver;
pub use tunnel::TunnelManager;
pub use wda_server::{ServerRegistry, WdaServer};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;

use crate::model::DeviceInfo;

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(rename = "deviceList", default)]
    device_list: Vec<String>,
}

/// List attached devices through the helper CLI (`ios list`).
pub async fn list_devices() -> Result<Vec<DeviceInfo>> {
    let output = Command::new("ios")
        .arg("list")
        .output()
        .await
        .context("failed to execute ios list (is go-ios installed?)")?;

    if !output.status.success() {
        anyhow::bail!(
            "ios list failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let parsed: DeviceList = serde_json::from_slice(&output.stdout)
        .context("unexpected ios list output")?;
    Ok(parsed
        .device_list
        .into_iter()
        .map(DeviceInfo::online)
        .collect())
}
