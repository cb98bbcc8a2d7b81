//! HarmonyOS driver over the `hdc` bridge CLI.
//!
//! The device-side `uitest` tool dumps the layout as JSON; it is rewritten
//! into the Android-convention XML (`bounds="[x1,y1][x2,y2]"`, `text`, `id`,
//! `type`) before entering the shared hierarchy pipeline.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use image::DynamicImage;
use tokio::process::Command;

use crate::driver::Driver;
use crate::error::DriverError;
use crate::hierarchy::parse_xml;
use crate::model::{AppInfo, CurrentApp, DeviceInfo, Node, Platform, WindowSize};

const SHELL_TIMEOUT: Duration = Duration::from_secs(20);

fn find_hdc() -> Result<std::path::PathBuf> {
    which::which("hdc").context("hdc not found in PATH")
}

async fn hdc_exec(serial: Option<&str>, args: &[&str]) -> Result<String> {
    let hdc = find_hdc()?;
    let mut cmd = Command::new(hdc);
    if let Some(s) = serial {
        cmd.args(["-t", s]);
    }
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

    let output = tokio::time::timeout(SHELL_TIMEOUT, cmd.output())
        .await
        .with_context(|| format!("hdc {:?} timed out", args))?
        .with_context(|| format!("failed to execute: hdc {:?}", args))?;

    if !output.status.success() {
        anyhow::bail!(
            "hdc command failed ({:?}): {}",
            args,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

async fn hdc_shell(serial: &str, cmd: &str) -> Result<String> {
    hdc_exec(Some(serial), &["shell", cmd]).await
}

/// List attached devices (`hdc list targets`).
pub async fn list_devices() -> Result<Vec<DeviceInfo>> {
    let output = hdc_exec(None, &["list", "targets"]).await?;
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains("Empty"))
        .map(DeviceInfo::online)
        .collect())
}

pub struct HarmonyDriver {
    serial: String,
}

impl HarmonyDriver {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
        }
    }

    async fn keyevent(&self, code: &str) -> Result<(), DriverError> {
        hdc_shell(&self.serial, &format!("uitest uiInput keyEvent {}", code))
            .await
            .map_err(DriverError::Other)?;
        Ok(())
    }
}

#[async_trait]
impl Driver for HarmonyDriver {
    fn platform(&self) -> Platform {
        Platform::Harmony
    }

    fn serial(&self) -> &str {
        &self.serial
    }

    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
        hdc_shell(&self.serial, &format!("uitest uiInput click {} {}", x, y))
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
        // uiInput swipe takes a velocity in px/s rather than a duration.
        let dx = (end_x - start_x) as f64;
        let dy = (end_y - start_y) as f64;
        let distance = (dx * dx + dy * dy).sqrt().max(1.0);
        let speed = (distance / duration.max(0.05)).clamp(200.0, 40000.0) as i64;
        hdc_shell(
            &self.serial,
            &format!(
                "uitest uiInput swipe {} {} {} {} {}",
                start_x, start_y, end_x, end_y, speed
            ),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn window_size(&self) -> Result<WindowSize, DriverError> {
        let output = hdc_shell(&self.serial, "hidumper -s RenderService -a screen")
            .await
            .unwrap_or_default();
        // Look for "physical screen resolution: 1260x2720" style lines.
        for line in output.lines() {
            if let Some(idx) = line.find("resolution") {
                let rest = &line[idx..];
                let digits: Vec<u32> = rest
                    .split(|c: char| !c.is_ascii_digit())
                    .filter_map(|s| s.parse().ok())
                    .collect();
                if digits.len() >= 2 && digits[0] > 0 && digits[1] > 0 {
                    return Ok(WindowSize {
                        width: digits[0],
                        height: digits[1],
                    });
                }
            }
        }
        // Last resort: measure the screenshot.
        let img = self.screenshot().await?;
        Ok(WindowSize {
            width: img.width(),
            height: img.height(),
        })
    }

    async fn screenshot(&self) -> Result<DynamicImage, DriverError> {
        let remote = "/data/local/tmp/byteautoui_snap.jpeg";
        hdc_shell(&self.serial, &format!("snapshot_display -f {}", remote))
            .await
            .map_err(DriverError::Other)?;
        let local = std::env::temp_dir().join(format!("byteautoui_snap_{}.jpeg", self.serial));
        hdc_exec(
            Some(&self.serial),
            &["file", "recv", remote, &local.to_string_lossy()],
        )
        .await
        .map_err(DriverError::Other)?;
        let bytes = std::fs::read(&local)
            .with_context(|| format!("failed to read {}", local.display()))
            .map_err(DriverError::Other)?;
        let _ = std::fs::remove_file(&local);
        image::load_from_memory(&bytes)
            .map_err(|e| DriverError::Other(anyhow::anyhow!("bad snapshot image: {}", e)))
    }

    async fn dump_hierarchy(&self) -> Result<(String, Node), DriverError> {
        let output = hdc_shell(&self.serial, "uitest dumpLayout")
            .await
            .map_err(DriverError::Other)?;
        // "DumpLayout saved to:/data/local/tmp/layout_XXX.json"
        let remote = output
            .split(':')
            .next_back()
            .map(str::trim)
            .filter(|p| p.ends_with(".json"))
            .ok_or_else(|| {
                DriverError::Other(anyhow::anyhow!("unexpected dumpLayout output: {}", output))
            })?
            .to_string();

        let raw = hdc_shell(&self.serial, &format!("cat {}", remote))
            .await
            .map_err(DriverError::Other)?;
        let layout: serde_json::Value = serde_json::from_str(raw.trim())
            .map_err(|e| DriverError::ParseError(format!("bad layout json: {}", e)))?;

        let xml = layout_json_to_xml(&layout);
        let wsize = self.window_size().await?;
        let tree = parse_xml(&xml, Platform::Harmony, wsize)?;
        Ok((xml, tree))
    }

    async fn home(&self) -> Result<(), DriverError> {
        self.keyevent("Home").await
    }

    async fn back(&self) -> Result<(), DriverError> {
        self.keyevent("Back").await
    }

    async fn app_switch(&self) -> Result<(), DriverError> {
        // Recents key.
        self.keyevent("2078").await
    }

    async fn volume_up(&self) -> Result<(), DriverError> {
        self.keyevent("16").await
    }

    async fn volume_down(&self) -> Result<(), DriverError> {
        self.keyevent("17").await
    }

    async fn volume_mute(&self) -> Result<(), DriverError> {
        self.keyevent("22").await
    }

    async fn wake_up(&self) -> Result<(), DriverError> {
        hdc_shell(&self.serial, "power-shell wakeup")
            .await
            .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn send_keys(&self, text: &str) -> Result<(), DriverError> {
        let escaped = text.replace('\'', "\\'");
        hdc_shell(
            &self.serial,
            &format!("uitest uiInput inputText '{}'", escaped),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn clear_text(&self) -> Result<(), DriverError> {
        // Forward-delete key, held a few times like the Android path.
        for _ in 0..3 {
            self.keyevent("2055").await?;
        }
        Ok(())
    }

    async fn app_install(&self, url: &str) -> Result<(), DriverError> {
        hdc_exec(Some(&self.serial), &["install", url])
            .await
            .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn app_launch(&self, package: &str) -> Result<(), DriverError> {
        hdc_shell(
            &self.serial,
            &format!("aa start -b {} -a EntryAbility", package),
        )
        .await
        .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn app_terminate(&self, package: &str) -> Result<(), DriverError> {
        hdc_shell(&self.serial, &format!("aa force-stop {}", package))
            .await
            .map_err(DriverError::Other)?;
        Ok(())
    }

    async fn app_current(&self) -> Result<CurrentApp, DriverError> {
        let output = hdc_shell(&self.serial, "aa dump -l")
            .await
            .map_err(DriverError::Other)?;
        for line in output.lines() {
            if let Some(idx) = line.find("bundle name [") {
                let rest = &line[idx + "bundle name [".len()..];
                if let Some(end) = rest.find(']') {
                    return Ok(CurrentApp {
                        package: rest[..end].to_string(),
                        activity: None,
                        pid: None,
                    });
                }
            }
        }
        Err(DriverError::Other(anyhow::anyhow!(
            "no foreground ability found"
        )))
    }

    async fn app_list(&self) -> Result<Vec<AppInfo>, DriverError> {
        let output = hdc_shell(&self.serial, "bm dump -a")
            .await
            .map_err(DriverError::Other)?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| l.contains('.') && !l.starts_with("ID:"))
            .map(|l| AppInfo {
                package_name: l.trim_end_matches(':').to_string(),
                version_name: None,
                version_code: None,
            })
            .collect())
    }
}

/// Rewrite the uitest layout JSON as hierarchy XML.
fn layout_json_to_xml(layout: &serde_json::Value) -> String {
    let mut out = String::from("<?xml version='1.0' encoding='UTF-8'?>");
    write_layout_node(layout, &mut out, true);
    out
}

fn write_layout_node(value: &serde_json::Value, out: &mut String, is_root: bool) {
    let attributes = value.get("attributes").and_then(|a| a.as_object());
    let tag = if is_root {
        "hierarchy".to_string()
    } else {
        attributes
            .and_then(|a| a.get("type"))
            .and_then(|t| t.as_str())
            .filter(|t| t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or("node")
            .to_string()
    };

    out.push('<');
    out.push_str(&tag);
    if let Some(attributes) = attributes {
        for (key, val) in attributes {
            if let Some(s) = val.as_str() {
                out.push(' ');
                out.push_str(key);
                out.push_str("=\"");
                out.push_str(&xml_escape(s));
                out.push('"');
            }
        }
    }

    let children = value
        .get("children")
        .and_then(|c| c.as_array())
        .map(|c| c.as_slice())
        .unwrap_or(&[]);
    if children.is_empty() {
        out.push_str("/>");
        return;
    }
    out.push('>');
    for child in children {
        write_layout_node(child, out, false);
    }
    out.push_str("</");
    out.push_str(&tag);
    out.push('>');
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_json_to_xml_roundtrips_through_parser() {
        let layout: serde_json::Value = serde_json::from_str(
            r#"{
  "attributes": {"type": "root", "bounds": "[0,0][1260,2720]"},
  "children": [
    {"attributes": {"type": "Button", "text": "OK", "id": "ok_btn",
                    "bounds": "[100,200][400,300]"},
     "children": []}
  ]
}"#,
        )
        .unwrap();
        let xml = layout_json_to_xml(&layout);
        assert!(xml.contains("bounds=\"[100,200][400,300]\""));

        let tree = parse_xml(
            &xml,
            Platform::Harmony,
            WindowSize {
                width: 1260,
                height: 2720,
            },
        )
        .unwrap();
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].bounds, Some([100, 200, 400, 300]));
        assert_eq!(tree.children[0].properties.get("text").unwrap(), "OK");
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape(r#"a<b>&"c""#), "a&lt;b&gt;&amp;&quot;c&quot;");
    }
}
