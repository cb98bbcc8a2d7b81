//! Thin wrappers around the Android platform bridge CLI.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;

use crate::model::{DeviceInfo, WindowSize};

/// Resolve the bridge binary from PATH.
pub fn find_adb() -> Result<std::path::PathBuf> {
    which::which("adb").context("adb not found in PATH")
}

fn base_command(serial: Option<&str>) -> Result<Command> {
    let adb_path = find_adb()?;
    let mut cmd = Command::new(adb_path);
    if let Some(s) = serial {
        cmd.args(["-s", s]);
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    Ok(cmd)
}

/// List connected devices with their extended tags.
pub async fn list_devices() -> Result<Vec<DeviceInfo>> {
    let mut cmd = base_command(None)?;
    let output = cmd
        .args(["devices", "-l"])
        .output()
        .await
        .context("failed to execute adb devices")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut devices = Vec::new();
    for line in stdout.lines().skip(1) {
        let mut parts = line.split_whitespace();
        let (serial, state) = match (parts.next(), parts.next()) {
            (Some(s), Some(st)) => (s, st),
            _ => continue,
        };
        let mut info = DeviceInfo {
            serial: serial.to_string(),
            status: state.to_string(),
            name: None,
            model: None,
            product: None,
            enabled: state == "device",
        };
        for tag in parts {
            if let Some((k, v)) = tag.split_once(':') {
                match k {
                    "device" => info.name = Some(v.to_string()),
                    "model" => info.model = Some(v.to_string()),
                    "product" => info.product = Some(v.to_string()),
                    _ => {}
                }
            }
        }
        devices.push(info);
    }
    Ok(devices)
}

/// Execute a bridge shell command, bounded by `timeout`.
pub async fn shell(serial: &str, cmd: &str, timeout: Duration) -> Result<String> {
    let mut command = base_command(Some(serial))?;
    command.arg("shell").arg(cmd);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .with_context(|| format!("adb shell timed out after {:?}: {}", timeout, cmd))?
        .with_context(|| format!("failed to execute: adb shell {}", cmd))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("adb shell failed ({}): {}", cmd, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Execute a raw bridge command (`adb -s <serial> <args...>`).
pub async fn exec(serial: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut command = base_command(Some(serial))?;
    command.args(args);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .with_context(|| format!("adb {:?} timed out after {:?}", args, timeout))?
        .with_context(|| format!("failed to execute: adb {:?}", args))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("adb command failed ({:?}): {}", args, stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// `exec-out` with raw binary output; used for screenshots. `exec-out` does
/// not always propagate exit status, so empty output is the failure signal.
pub async fn exec_out_binary(serial: &str, cmd: &str, timeout: Duration) -> Result<Vec<u8>> {
    let mut command = base_command(Some(serial))?;
    command.arg("exec-out").arg(cmd);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .with_context(|| format!("adb exec-out timed out after {:?}: {}", timeout, cmd))?
        .with_context(|| format!("failed to execute: adb exec-out {}", cmd))?;

    if output.stdout.is_empty() && !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("adb exec-out failed ({}): {}", cmd, stderr.trim());
    }
    Ok(output.stdout)
}

/// Pull a device file into memory via `exec-out cat`.
pub async fn read_device_file(serial: &str, remote: &str, timeout: Duration) -> Result<Vec<u8>> {
    exec_out_binary(serial, &format!("cat {}", remote), timeout).await
}

/// Install an APK, replacing any existing install.
pub async fn install(serial: &str, apk_path: &str) -> Result<()> {
    exec(serial, &["install", "-r", apk_path], Duration::from_secs(120)).await?;
    Ok(())
}

/// Forward a local TCP port to a device port. Passing `local = 0` lets the
/// bridge pick a free port, which it prints on stdout.
pub async fn forward(serial: &str, local: u16, remote: u16) -> Result<u16> {
    let output = exec(
        serial,
        &[
            "forward",
            &format!("tcp:{}", local),
            &format!("tcp:{}", remote),
        ],
        Duration::from_secs(5),
    )
    .await?;
    if local != 0 {
        return Ok(local);
    }
    output
        .trim()
        .parse::<u16>()
        .with_context(|| format!("unexpected adb forward output: {:?}", output))
}

/// Send a keyevent by name (`HOME`, `BACK`, ...).
pub async fn keyevent(serial: &str, key: &str) -> Result<()> {
    shell(
        serial,
        &format!("input keyevent {}", key),
        Duration::from_secs(10),
    )
    .await?;
    Ok(())
}

/// Screen resolution, honoring overrides and rotation.
pub async fn window_size(serial: &str) -> Result<WindowSize> {
    let output = shell(serial, "wm size", Duration::from_secs(10)).await?;

    let mut width: u32 = 1080;
    let mut height: u32 = 1920;
    for line in output.lines() {
        // Prefer Override size when present.
        if line.contains("Override size:") || line.contains("Physical size:") {
            if let Some(size_str) = line.split(':').nth(1) {
                let parts: Vec<&str> = size_str.trim().split('x').collect();
                if parts.len() == 2 {
                    width = parts[0].trim().parse().unwrap_or(1080);
                    height = parts[1].trim().parse().unwrap_or(1920);
                    if line.contains("Override size:") {
                        break;
                    }
                }
            }
        }
    }

    // mRotation=1 (90°) or mRotation=3 (270°) means landscape.
    let rotation = shell(
        serial,
        "dumpsys window displays | grep mRotation",
        Duration::from_secs(5),
    )
    .await
    .unwrap_or_default();
    let landscape = rotation.contains("mRotation=1") || rotation.contains("mRotation=3");

    if landscape && height > width {
        Ok(WindowSize {
            width: height,
            height: width,
        })
    } else {
        Ok(WindowSize { width, height })
    }
}
