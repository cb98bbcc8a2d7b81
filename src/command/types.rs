//! Request and response types for `POST /api/{platform}/{serial}/command/{command}`.

use serde::{Deserialize, Serialize};

use crate::assertion::{AssertExpect, AssertionCondition, ElementSelector, ImageTemplate, WaitConfig};
use crate::model::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    #[serde(rename = "tap")]
    Tap,
    #[serde(rename = "swipe")]
    Swipe,
    #[serde(rename = "swipeUp")]
    SwipeUp,
    #[serde(rename = "swipeDown")]
    SwipeDown,
    #[serde(rename = "swipeLeft")]
    SwipeLeft,
    #[serde(rename = "swipeRight")]
    SwipeRight,
    #[serde(rename = "home")]
    Home,
    #[serde(rename = "back")]
    Back,
    #[serde(rename = "appSwitch")]
    AppSwitch,
    #[serde(rename = "volumeUp")]
    VolumeUp,
    #[serde(rename = "volumeDown")]
    VolumeDown,
    #[serde(rename = "volumeMute")]
    VolumeMute,
    #[serde(rename = "wakeUp")]
    WakeUp,
    #[serde(rename = "sendKeys")]
    SendKeys,
    #[serde(rename = "clearText")]
    ClearText,
    #[serde(rename = "installApp")]
    InstallApp,
    #[serde(rename = "appLaunch")]
    AppLaunch,
    #[serde(rename = "appTerminate")]
    AppTerminate,
    #[serde(rename = "appCurrent", alias = "currentApp")]
    AppCurrent,
    #[serde(rename = "appList")]
    AppList,
    #[serde(rename = "getWindowSize")]
    GetWindowSize,
    #[serde(rename = "dump")]
    Dump,
    #[serde(rename = "findElements")]
    FindElements,
    #[serde(rename = "clickElement")]
    ClickElement,
    #[serde(rename = "start_mjpeg_stream")]
    StartMjpegStream,
    #[serde(rename = "stop_mjpeg_stream")]
    StopMjpegStream,
    #[serde(rename = "assertElement")]
    AssertElement,
    #[serde(rename = "assertImage")]
    AssertImage,
    #[serde(rename = "assertCombined")]
    AssertCombined,
    #[serde(rename = "list")]
    List,
}

impl Command {
    /// Wire name, as it appears in the URL path.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Tap => "tap",
            Command::Swipe => "swipe",
            Command::SwipeUp => "swipeUp",
            Command::SwipeDown => "swipeDown",
            Command::SwipeLeft => "swipeLeft",
            Command::SwipeRight => "swipeRight",
            Command::Home => "home",
            Command::Back => "back",
            Command::AppSwitch => "appSwitch",
            Command::VolumeUp => "volumeUp",
            Command::VolumeDown => "volumeDown",
            Command::VolumeMute => "volumeMute",
            Command::WakeUp => "wakeUp",
            Command::SendKeys => "sendKeys",
            Command::ClearText => "clearText",
            Command::InstallApp => "installApp",
            Command::AppLaunch => "appLaunch",
            Command::AppTerminate => "appTerminate",
            Command::AppCurrent => "appCurrent",
            Command::AppList => "appList",
            Command::GetWindowSize => "getWindowSize",
            Command::Dump => "dump",
            Command::FindElements => "findElements",
            Command::ClickElement => "clickElement",
            Command::StartMjpegStream => "start_mjpeg_stream",
            Command::StopMjpegStream => "stop_mjpeg_stream",
            Command::AssertElement => "assertElement",
            Command::AssertImage => "assertImage",
            Command::AssertCombined => "assertCombined",
            Command::List => "list",
        }
    }

    pub fn parse(raw: &str) -> Option<Command> {
        serde_json::from_value(serde_json::Value::String(raw.to_string())).ok()
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TapRequest {
    pub x: f64,
    pub y: f64,
    #[serde(rename = "isPercent", default)]
    pub is_percent: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwipeRequest {
    #[serde(rename = "startX")]
    pub start_x: f64,
    #[serde(rename = "startY")]
    pub start_y: f64,
    #[serde(rename = "endX")]
    pub end_x: f64,
    #[serde(rename = "endY")]
    pub end_y: f64,
    /// Seconds.
    #[serde(default = "default_swipe_duration")]
    pub duration: f64,
}

fn default_swipe_duration() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendKeysRequest {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstallAppRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallAppResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppLaunchRequest {
    pub package: String,
    #[serde(default)]
    pub stop: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppTerminateRequest {
    pub package: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowSizeResponse {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DumpResponse {
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FindElementResponse {
    pub count: usize,
    pub value: Vec<Node>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssertElementRequest {
    pub selector: ElementSelector,
    pub expect: AssertExpect,
    #[serde(default)]
    pub wait: Option<WaitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssertImageRequest {
    pub template: ImageTemplate,
    pub expect: AssertExpect,
    #[serde(default)]
    pub wait: Option<WaitConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssertCombinedRequest {
    pub operator: String,
    pub conditions: Vec<AssertionCondition>,
    #[serde(default)]
    pub wait: Option<WaitConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_names() {
        assert_eq!(Command::parse("tap"), Some(Command::Tap));
        assert_eq!(Command::parse("swipeUp"), Some(Command::SwipeUp));
        assert_eq!(Command::parse("start_mjpeg_stream"), Some(Command::StartMjpegStream));
        assert_eq!(Command::parse("appCurrent"), Some(Command::AppCurrent));
        // Legacy wire name still routes.
        assert_eq!(Command::parse("currentApp"), Some(Command::AppCurrent));
        assert_eq!(Command::parse("definitelyNot"), None);
    }

    #[test]
    fn test_tap_request_defaults() {
        let req: TapRequest = serde_json::from_str(r#"{"x": 10, "y": 20}"#).unwrap();
        assert!(!req.is_percent);
        let req: TapRequest =
            serde_json::from_str(r#"{"x": 0.5, "y": 0.5, "isPercent": true}"#).unwrap();
        assert!(req.is_percent);
    }

    #[test]
    fn test_assert_combined_request_shape() {
        let raw = r#"{
            "operator": "and",
            "conditions": [
                {"type": "element",
                 "selector": {"xpath": "//*[@text='Login']", "attributes": {"text": "Login"}},
                 "expect": "exists"}
            ],
            "wait": {"enabled": true, "timeout": 500, "interval": 100}
        }"#;
        let req: AssertCombinedRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.operator, "and");
        assert_eq!(req.conditions.len(), 1);
        assert!(req.wait.unwrap().enabled);
    }
}
