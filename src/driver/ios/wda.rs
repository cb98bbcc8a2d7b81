//! HTTP client for the on-device WebDriverAgent runner.
//!
//! The runner listens on the forwarded control port and speaks the WebDriver
//! wire protocol with WDA extensions (`/wda/...`). A session is created on
//! first use and reused for the life of the driver.

use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::model::WindowSize;

/// MJPEG tuning applied at session creation (or through the live settings
/// endpoint when the capability set is rejected). A `None` field is removed
/// from the emitted settings entirely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MjpegSettings {
    #[serde(
        rename = "mjpegServerFramerate",
        skip_serializing_if = "Option::is_none"
    )]
    pub framerate: Option<u32>,
    #[serde(
        rename = "mjpegServerScreenshotQuality",
        skip_serializing_if = "Option::is_none"
    )]
    pub screenshot_quality: Option<u32>,
    #[serde(rename = "mjpegScalingFactor", skip_serializing_if = "Option::is_none")]
    pub scaling_factor: Option<u32>,
}

impl Default for MjpegSettings {
    fn default() -> Self {
        Self {
            framerate: Some(30),
            screenshot_quality: Some(50),
            scaling_factor: Some(50),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WdaResponse<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
struct StatusValue {
    #[serde(default)]
    ready: bool,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    value: StatusValue,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionValue {
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    value: SessionValue,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

pub struct WdaClient {
    base_url: String,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
}

impl WdaClient {
    pub fn new(port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            base_url: format!("http://127.0.0.1:{}", port),
            http,
            session_id: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn is_ready(&self) -> bool {
        let url = format!("{}/status", self.base_url);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<StatusResponse>()
                .await
                .map(|s| s.value.ready)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Create a session with the given capability set. The caller decides
    /// what to do when the runner rejects the capabilities.
    pub async fn create_session(&self, capabilities: serde_json::Value) -> Result<String> {
        let url = format!("{}/session", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&json!({ "capabilities": capabilities }))
            .send()
            .await
            .context("failed to create WDA session")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("session request rejected ({}): {:.200}", status, body);
        }

        let parsed: SessionResponse = resp
            .json()
            .await
            .context("failed to parse session response")?;
        let session_id = parsed
            .session_id
            .or(parsed.value.session_id)
            .context("no session id in response")?;
        *self.session_id.lock().await = Some(session_id.clone());
        Ok(session_id)
    }

    /// Reuse the active session from `/status`, or create a bare one.
    async fn ensure_session(&self) -> Result<String> {
        if let Some(id) = self.session_id.lock().await.clone() {
            return Ok(id);
        }

        let url = format!("{}/status", self.base_url);
        if let Ok(resp) = self.http.get(&url).send().await {
            if let Ok(status) = resp.json::<StatusResponse>().await {
                if let Some(id) = status.session_id.or(status.value.session_id) {
                    *self.session_id.lock().await = Some(id.clone());
                    return Ok(id);
                }
            }
        }

        self.create_session(json!({})).await
    }

    async fn session_post(&self, suffix: &str, body: serde_json::Value) -> Result<()> {
        let session_id = self.ensure_session().await?;
        let url = format!("{}/session/{}/{}", self.base_url, session_id, suffix);
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed POST {}", suffix))?;
        if !resp.status().is_success() {
            let status = resp.status();
            // A stale session id means the runner restarted under us.
            if status == reqwest::StatusCode::NOT_FOUND {
                *self.session_id.lock().await = None;
            }
            anyhow::bail!("{} returned {}", suffix, status);
        }
        Ok(())
    }

    /// Push live settings to the runner (`appium/settings`).
    pub async fn apply_settings(&self, settings: &MjpegSettings) -> Result<()> {
        self.session_post("appium/settings", json!({ "settings": settings }))
            .await
    }

    pub async fn tap(&self, x: i32, y: i32) -> Result<()> {
        self.session_post("wda/tap/0", json!({ "x": x as f64, "y": y as f64 }))
            .await
    }

    pub async fn swipe(
        &self,
        from_x: i32,
        from_y: i32,
        to_x: i32,
        to_y: i32,
        duration: f64,
    ) -> Result<()> {
        self.session_post(
            "wda/dragFromToForDuration",
            json!({
                "fromX": from_x as f64,
                "fromY": from_y as f64,
                "toX": to_x as f64,
                "toY": to_y as f64,
                "duration": duration,
            }),
        )
        .await
    }

    /// The runner expects each character as a separate string.
    pub async fn send_keys(&self, text: &str) -> Result<()> {
        let chars: Vec<String> = text.chars().map(|c| c.to_string()).collect();
        self.session_post("wda/keys", json!({ "value": chars })).await
    }

    pub async fn press_button(&self, name: &str) -> Result<()> {
        self.session_post("wda/pressButton", json!({ "name": name }))
            .await
    }

    pub async fn unlock(&self) -> Result<()> {
        self.session_post("wda/unlock", json!({})).await
    }

    pub async fn app_launch(&self, bundle_id: &str) -> Result<()> {
        self.session_post("wda/apps/launch", json!({ "bundleId": bundle_id }))
            .await
    }

    pub async fn app_terminate(&self, bundle_id: &str) -> Result<()> {
        self.session_post("wda/apps/terminate", json!({ "bundleId": bundle_id }))
            .await
    }

    pub async fn active_app_info(&self) -> Result<(String, Option<i32>)> {
        let session_id = self.ensure_session().await?;
        let url = format!(
            "{}/session/{}/wda/activeAppInfo",
            self.base_url, session_id
        );
        let resp: WdaResponse<serde_json::Value> = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to get active app info")?
            .json()
            .await
            .context("failed to parse active app info")?;
        let bundle_id = resp
            .value
            .get("bundleId")
            .and_then(|v| v.as_str())
            .context("active app info has no bundleId")?
            .to_string();
        let pid = resp.value.get("pid").and_then(|v| v.as_i64()).map(|p| p as i32);
        Ok((bundle_id, pid))
    }

    /// Raw hierarchy XML from the runner's source endpoint.
    pub async fn source(&self) -> Result<String> {
        let url = format!("{}/source?format=xml", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to get source")?;
        let parsed: WdaResponse<String> =
            resp.json().await.context("failed to parse source response")?;
        Ok(parsed.value)
    }

    /// PNG bytes of the current screen.
    pub async fn screenshot(&self) -> Result<Vec<u8>> {
        let url = format!("{}/screenshot", self.base_url);
        let resp: WdaResponse<String> = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to take screenshot")?
            .json()
            .await
            .context("failed to parse screenshot response")?;
        base64::engine::general_purpose::STANDARD
            .decode(resp.value.trim())
            .context("screenshot is not valid base64")
    }

    pub async fn window_size(&self) -> Result<WindowSize> {
        let session_id = self.ensure_session().await?;
        let url = format!("{}/session/{}/window/size", self.base_url, session_id);

        #[derive(Deserialize)]
        struct SizeValue {
            width: f64,
            height: f64,
        }

        let resp: WdaResponse<SizeValue> = self
            .http
            .get(&url)
            .send()
            .await
            .context("failed to get window size")?
            .json()
            .await
            .context("failed to parse window size")?;
        Ok(WindowSize {
            width: resp.value.width as u32,
            height: resp.value.height as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_base_url() {
        let client = WdaClient::new(8100);
        assert_eq!(client.base_url(), "http://127.0.0.1:8100");
    }

    #[test]
    fn test_mjpeg_settings_defaults() {
        let settings = MjpegSettings::default();
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "mjpegServerFramerate": 30,
                "mjpegServerScreenshotQuality": 50,
                "mjpegScalingFactor": 50,
            })
        );
    }

    #[test]
    fn test_mjpeg_settings_none_removes_field() {
        let settings = MjpegSettings {
            framerate: Some(15),
            screenshot_quality: None,
            scaling_factor: Some(25),
        };
        let value = serde_json::to_value(&settings).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "mjpegServerFramerate": 15,
                "mjpegScalingFactor": 25,
            })
        );
        assert!(value.get("mjpegServerScreenshotQuality").is_none());
    }

    #[test]
    fn test_status_response_shapes() {
        let raw = r#"{"value":{"ready":true,"sessionId":"abc"},"sessionId":null}"#;
        let parsed: StatusResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.value.ready);
        assert_eq!(parsed.value.session_id.as_deref(), Some("abc"));

        // Runners that report state instead of ready still parse.
        let raw = r#"{"value":{"state":"success"}}"#;
        let parsed: StatusResponse = serde_json::from_str(raw).unwrap();
        assert!(!parsed.value.ready);
    }
}
