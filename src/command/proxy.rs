//! Command dispatcher: resolves a normalized command against a driver.
//!
//! Commands that declare a params type reject requests with missing or
//! malformed bodies (`InvalidArgument`, carrying the serde failure path);
//! unknown command strings never reach this table; they fail to parse at
//! the route and surface as `NotImplemented`.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::time::Instant;

use super::types::*;
use crate::assertion::{self, AssertionCondition};
use crate::driver::Driver;
use crate::error::DriverError;
use crate::hierarchy::query::{find_in_tree, xpath_to_nodes, By, ElementQuery};
use crate::model::Node;

/// Poll step for `clickElement`.
const CLICK_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn parse_params<T: DeserializeOwned>(
    command: Command,
    params: Option<Value>,
) -> Result<T, DriverError> {
    let value = params.ok_or_else(|| {
        DriverError::InvalidArgument(format!("params is required for {}", command))
    })?;
    serde_json::from_value(value).map_err(|e| {
        DriverError::InvalidArgument(format!("invalid params for {}: {}", command, e))
    })
}

/// Execute `command` against `driver`, returning the response as JSON.
pub async fn send_command(
    driver: &dyn Driver,
    command: Command,
    params: Option<Value>,
) -> Result<Value, DriverError> {
    match command {
        Command::Tap => {
            let req: TapRequest = parse_params(command, params)?;
            let (x, y) = resolve_tap_point(driver, req.x, req.y, req.is_percent).await?;
            driver.tap(x, y).await?;
            Ok(json!({ "status": "ok" }))
        }
        Command::Swipe => {
            let req: SwipeRequest = parse_params(command, params)?;
            driver
                .swipe(
                    req.start_x as i32,
                    req.start_y as i32,
                    req.end_x as i32,
                    req.end_y as i32,
                    req.duration,
                )
                .await?;
            Ok(json!({ "status": "ok" }))
        }
        Command::SwipeUp | Command::SwipeDown | Command::SwipeLeft | Command::SwipeRight => {
            directional_swipe(driver, command).await?;
            Ok(json!({ "status": "ok" }))
        }
        Command::Home => unit(driver.home().await),
        Command::Back => unit(driver.back().await),
        Command::AppSwitch => unit(driver.app_switch().await),
        Command::VolumeUp => unit(driver.volume_up().await),
        Command::VolumeDown => unit(driver.volume_down().await),
        Command::VolumeMute => unit(driver.volume_mute().await),
        Command::WakeUp => unit(driver.wake_up().await),
        Command::SendKeys => {
            let req: SendKeysRequest = parse_params(command, params)?;
            unit(driver.send_keys(&req.text).await)
        }
        Command::ClearText => unit(driver.clear_text().await),
        Command::InstallApp => {
            let req: InstallAppRequest = parse_params(command, params)?;
            driver.app_install(&req.url).await?;
            Ok(serde_json::to_value(InstallAppResponse {
                success: true,
                id: None,
            })
            .unwrap_or_default())
        }
        Command::AppLaunch => {
            let req: AppLaunchRequest = parse_params(command, params)?;
            if req.stop {
                driver.app_terminate(&req.package).await?;
            }
            unit(driver.app_launch(&req.package).await)
        }
        Command::AppTerminate => {
            let req: AppTerminateRequest = parse_params(command, params)?;
            unit(driver.app_terminate(&req.package).await)
        }
        Command::AppCurrent => {
            let current = driver.app_current().await?;
            Ok(serde_json::to_value(current).unwrap_or_default())
        }
        Command::AppList => {
            let apps = driver.app_list().await?;
            Ok(serde_json::to_value(apps).unwrap_or_default())
        }
        Command::GetWindowSize => {
            let wsize = driver.window_size().await?;
            Ok(serde_json::to_value(WindowSizeResponse {
                width: wsize.width,
                height: wsize.height,
            })
            .unwrap_or_default())
        }
        Command::Dump => {
            let (xml, _) = driver.dump_hierarchy().await?;
            Ok(serde_json::to_value(DumpResponse { value: xml }).unwrap_or_default())
        }
        Command::FindElements => {
            let req: ElementQuery = parse_params(command, params)?;
            let nodes = find_elements(driver, &req).await?;
            Ok(serde_json::to_value(FindElementResponse {
                count: nodes.len(),
                value: nodes,
            })
            .unwrap_or_default())
        }
        Command::ClickElement => {
            let req: ElementQuery = parse_params(command, params)?;
            click_element(driver, &req).await?;
            Ok(json!({ "status": "ok" }))
        }
        Command::StartMjpegStream => {
            let started = driver.start_mjpeg_stream().await?;
            Ok(json!({ "success": started }))
        }
        Command::StopMjpegStream => {
            let stopped = driver.stop_mjpeg_stream().await?;
            Ok(json!({ "success": stopped }))
        }
        Command::AssertElement => {
            let req: AssertElementRequest = parse_params(command, params)?;
            let conditions = vec![AssertionCondition::Element {
                selector: req.selector,
                expect: req.expect,
            }];
            let result =
                assertion::execute_combined(driver, "and", &conditions, req.wait.as_ref()).await?;
            Ok(serde_json::to_value(result).unwrap_or_default())
        }
        Command::AssertImage => {
            let req: AssertImageRequest = parse_params(command, params)?;
            let conditions = vec![AssertionCondition::Image {
                template: req.template,
                expect: req.expect,
            }];
            let result =
                assertion::execute_combined(driver, "and", &conditions, req.wait.as_ref()).await?;
            Ok(serde_json::to_value(result).unwrap_or_default())
        }
        Command::AssertCombined => {
            let req: AssertCombinedRequest = parse_params(command, params)?;
            let result = assertion::execute_combined(
                driver,
                &req.operator,
                &req.conditions,
                req.wait.as_ref(),
            )
            .await?;
            Ok(serde_json::to_value(result).unwrap_or_default())
        }
        Command::List => Err(DriverError::NotImplemented(
            "list is handled by the provider, not a device".to_string(),
        )),
    }
}

fn unit(result: Result<(), DriverError>) -> Result<Value, DriverError> {
    result.map(|_| json!({ "status": "ok" }))
}

/// Percent coordinates are scaled by the window size; the 1.0 edge maps to
/// the last pixel.
async fn resolve_tap_point(
    driver: &dyn Driver,
    x: f64,
    y: f64,
    is_percent: bool,
) -> Result<(i32, i32), DriverError> {
    if !is_percent {
        return Ok((x as i32, y as i32));
    }
    let wsize = driver.window_size().await?;
    let px = ((wsize.width as f64 * x) as i32).min(wsize.width as i32 - 1);
    let py = ((wsize.height as f64 * y) as i32).min(wsize.height as i32 - 1);
    Ok((px, py))
}

/// Fixed fractional endpoints over 0.3 s.
async fn directional_swipe(driver: &dyn Driver, command: Command) -> Result<(), DriverError> {
    let wsize = driver.window_size().await?;
    let (w, h) = (wsize.width as i32, wsize.height as i32);
    let (sx, sy, ex, ey) = match command {
        Command::SwipeUp => (w / 2, h * 4 / 5, w / 2, h / 5),
        Command::SwipeDown => (w / 2, h / 5, w / 2, h * 4 / 5),
        Command::SwipeLeft => (w * 4 / 5, h / 2, w / 5, h / 2),
        Command::SwipeRight => (w / 5, h / 2, w * 4 / 5, h / 2),
        _ => unreachable!("directional_swipe called with {:?}", command),
    };
    driver.swipe(sx, sy, ex, ey, 0.3).await
}

/// `by=xpath` goes against the raw XML; everything else walks the parsed
/// tree in document order.
pub async fn find_elements(
    driver: &dyn Driver,
    query: &ElementQuery,
) -> Result<Vec<Node>, DriverError> {
    let (xml, tree) = driver.dump_hierarchy().await?;
    if query.by == By::XPath {
        return xpath_to_nodes(&xml, &query.value, driver.platform());
    }
    Ok(find_in_tree(&tree, query.by, &query.value)
        .into_iter()
        .cloned()
        .collect())
}

/// Poll for the element until the query deadline, then tap its center.
/// Bounds in the unit square are treated as normalized and scaled by the
/// window size.
pub async fn click_element(driver: &dyn Driver, query: &ElementQuery) -> Result<(), DriverError> {
    let deadline = Instant::now() + Duration::from_secs_f64(query.timeout.max(0.0));
    let node = loop {
        let found = find_elements(driver, query).await?;
        if let Some(node) = found.into_iter().next() {
            break node;
        }
        if Instant::now() >= deadline {
            return Err(DriverError::ElementNotFound(format!(
                "element not found by {:?}={}",
                query.by, query.value
            )));
        }
        tokio::time::sleep(CLICK_POLL_INTERVAL).await;
    };

    let bounds = node_float_bounds(&node).ok_or_else(|| {
        DriverError::ElementNotFound(format!(
            "element {} has no usable bounds",
            node.key
        ))
    })?;

    let cx = (bounds[0] + bounds[2]) / 2.0;
    let cy = (bounds[1] + bounds[3]) / 2.0;
    let (x, y) = if bounds[2] <= 1.0 && bounds[3] <= 1.0 {
        // Normalized coordinates; scale by the current window.
        let wsize = driver.window_size().await?;
        (
            (wsize.width as f64 * cx) as i32,
            (wsize.height as f64 * cy) as i32,
        )
    } else {
        (cx as i32, cy as i32)
    };
    driver.tap(x, y).await
}

/// Element geometry as floats: parsed bounds first, then the raw
/// `x`/`y`/`width`/`height` properties.
fn node_float_bounds(node: &Node) -> Option<[f64; 4]> {
    if let Some(b) = node.bounds {
        return Some([b[0] as f64, b[1] as f64, b[2] as f64, b[3] as f64]);
    }
    let get = |k: &str| node.properties.get(k)?.parse::<f64>().ok();
    let (x, y, w, h) = (get("x")?, get("y")?, get("width")?, get("height")?);
    Some([x, y, x + w, y + h])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;
    use crate::model::{AppInfo, CurrentApp, Platform, WindowSize};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records taps so dispatch behavior is observable.
    struct RecordingDriver {
        xml: String,
        taps: Mutex<Vec<(i32, i32)>>,
        swipes: Mutex<Vec<(i32, i32, i32, i32, f64)>>,
    }

    impl RecordingDriver {
        fn new(xml: &str) -> Self {
            Self {
                xml: xml.to_string(),
                taps: Mutex::new(Vec::new()),
                swipes: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        fn platform(&self) -> Platform {
            Platform::Android
        }
        fn serial(&self) -> &str {
            "recorder"
        }
        async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError> {
            self.taps.lock().unwrap().push((x, y));
            Ok(())
        }
        async fn swipe(
            &self,
            sx: i32,
            sy: i32,
            ex: i32,
            ey: i32,
            d: f64,
        ) -> Result<(), DriverError> {
            self.swipes.lock().unwrap().push((sx, sy, ex, ey, d));
            Ok(())
        }
        async fn window_size(&self) -> Result<WindowSize, DriverError> {
            Ok(WindowSize {
                width: 1080,
                height: 1920,
            })
        }
        async fn screenshot(&self) -> Result<image::DynamicImage, DriverError> {
            Ok(image::DynamicImage::new_rgb8(4, 4))
        }
        async fn dump_hierarchy(&self) -> Result<(String, Node), DriverError> {
            let tree = crate::hierarchy::parse_xml(
                &self.xml,
                Platform::Android,
                WindowSize {
                    width: 1080,
                    height: 1920,
                },
            )?;
            Ok((self.xml.clone(), tree))
        }
        async fn home(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn back(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn app_switch(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn volume_up(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn volume_down(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn volume_mute(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn wake_up(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn send_keys(&self, _text: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn clear_text(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn app_install(&self, _url: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn app_launch(&self, _p: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn app_terminate(&self, _p: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn app_current(&self) -> Result<CurrentApp, DriverError> {
            Ok(CurrentApp {
                package: "com.example".into(),
                activity: None,
                pid: None,
            })
        }
        async fn app_list(&self) -> Result<Vec<AppInfo>, DriverError> {
            Ok(Vec::new())
        }
    }

    const XML: &str = r#"<?xml version='1.0'?>
<hierarchy>
  <node index="0" text="Login" resource-id="com.example:id/login_btn"
        class="android.widget.Button" bounds="[100,200][500,300]"/>
</hierarchy>"#;

    #[tokio::test]
    async fn test_percent_tap_scales_by_window() {
        let driver = RecordingDriver::new(XML);
        send_command(
            &driver,
            Command::Tap,
            Some(json!({"x": 0.5, "y": 0.5, "isPercent": true})),
        )
        .await
        .unwrap();
        assert_eq!(driver.taps.lock().unwrap()[0], (540, 960));
    }

    #[tokio::test]
    async fn test_percent_tap_edge_hits_last_pixel() {
        let driver = RecordingDriver::new(XML);
        send_command(
            &driver,
            Command::Tap,
            Some(json!({"x": 1, "y": 1, "isPercent": true})),
        )
        .await
        .unwrap();
        assert_eq!(driver.taps.lock().unwrap()[0], (1079, 1919));
    }

    #[tokio::test]
    async fn test_missing_params_is_invalid_argument() {
        let driver = RecordingDriver::new(XML);
        let err = send_command(&driver, Command::Tap, None).await.unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
        let err = send_command(&driver, Command::Tap, Some(json!({"x": "oops"})))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_directional_swipe_endpoints() {
        let driver = RecordingDriver::new(XML);
        send_command(&driver, Command::SwipeUp, None).await.unwrap();
        let swipes = driver.swipes.lock().unwrap();
        assert_eq!(swipes[0], (540, 1536, 540, 384, 0.3));
    }

    #[tokio::test]
    async fn test_find_elements_by_id_and_xpath() {
        let driver = RecordingDriver::new(XML);
        let result = send_command(
            &driver,
            Command::FindElements,
            Some(json!({"by": "id", "value": "com.example:id/login_btn", "timeout": 1.0})),
        )
        .await
        .unwrap();
        assert_eq!(result["count"], json!(1));

        let result = send_command(
            &driver,
            Command::FindElements,
            Some(json!({"by": "xpath", "value": "//node[@text='Login']", "timeout": 1.0})),
        )
        .await
        .unwrap();
        assert_eq!(result["count"], json!(1));
    }

    #[tokio::test]
    async fn test_click_element_taps_center() {
        let driver = RecordingDriver::new(XML);
        send_command(
            &driver,
            Command::ClickElement,
            Some(json!({"by": "text", "value": "Login", "timeout": 1.0})),
        )
        .await
        .unwrap();
        assert_eq!(driver.taps.lock().unwrap()[0], (300, 250));
    }

    #[tokio::test]
    async fn test_click_element_not_found_at_deadline() {
        let driver = RecordingDriver::new(XML);
        let err = send_command(
            &driver,
            Command::ClickElement,
            Some(json!({"by": "text", "value": "Missing", "timeout": 0.0})),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DriverError::ElementNotFound(_)));
    }

    #[tokio::test]
    async fn test_click_element_normalized_bounds() {
        let xml = r#"<hierarchy>
  <node index="0" text="Unit" bounds="[0,0][1,1]"/>
</hierarchy>"#;
        let driver = RecordingDriver::new(xml);
        send_command(
            &driver,
            Command::ClickElement,
            Some(json!({"by": "text", "value": "Unit", "timeout": 1.0})),
        )
        .await
        .unwrap();
        // Center (0.5, 0.5) scaled by 1080x1920.
        assert_eq!(driver.taps.lock().unwrap()[0], (540, 960));
    }

    #[tokio::test]
    async fn test_click_element_derives_bounds_from_properties() {
        let xml = r#"<hierarchy>
  <node index="0" text="Sized" x="100" y="100" width="200" height="100"/>
</hierarchy>"#;
        let driver = RecordingDriver::new(xml);
        send_command(
            &driver,
            Command::ClickElement,
            Some(json!({"by": "text", "value": "Sized", "timeout": 1.0})),
        )
        .await
        .unwrap();
        assert_eq!(driver.taps.lock().unwrap()[0], (200, 150));
    }

    #[tokio::test]
    async fn test_assert_combined_through_dispatcher() {
        let driver = RecordingDriver::new(XML);
        let result = send_command(
            &driver,
            Command::AssertCombined,
            Some(json!({
                "operator": "and",
                "conditions": [{
                    "type": "element",
                    "selector": {
                        "xpath": "//*[@resource-id='com.example:id/login_btn']",
                        "attributes": {"text": "Login"}
                    },
                    "expect": "exists"
                }]
            })),
        )
        .await
        .unwrap();
        assert_eq!(result["success"], json!(true));
        assert_eq!(result["message"], json!("assertion passed"));
    }

    #[tokio::test]
    async fn test_app_launch_with_stop_flag() {
        let driver = RecordingDriver::new(XML);
        let result = send_command(
            &driver,
            Command::AppLaunch,
            Some(json!({"package": "com.example", "stop": true})),
        )
        .await
        .unwrap();
        assert_eq!(result["status"], json!("ok"));
    }
}
