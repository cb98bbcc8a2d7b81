//! Assertion engine: element and image conditions combined with and/or and
//! retried until a deadline.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use image::GrayImage;
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use crate::driver::Driver;
use crate::error::DriverError;
use crate::hierarchy::query::{attr_alias, xpath_select};
use crate::model::Platform;

/// Template images above this raw size are rejected.
pub const MAX_TEMPLATE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_INTERVAL_MS: u64 = 300;
pub const DEFAULT_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertExpect {
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementSelector {
    pub xpath: String,
    /// Expected attribute values keyed by logical name (`text`,
    /// `resourceId`, `className`); `null` values are ignored.
    #[serde(default)]
    pub attributes: Option<HashMap<String, Option<String>>>,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTemplate {
    /// Base64 PNG, with or without a `data:...;base64,` prefix.
    pub data: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AssertionCondition {
    Element {
        selector: ElementSelector,
        expect: AssertExpect,
    },
    Image {
        template: ImageTemplate,
        expect: AssertExpect,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_wait_timeout")]
    pub timeout: u64,
    #[serde(default = "default_wait_interval")]
    pub interval: u64,
}

fn default_wait_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_wait_interval() -> u64 {
    DEFAULT_INTERVAL_MS
}

#[derive(Debug, Clone, Serialize)]
pub struct AssertionResult {
    pub success: bool,
    pub message: String,
    pub details: serde_json::Value,
}

/// Run a combined assertion with retry-until-deadline semantics.
///
/// Wall time is bounded by `timeout + interval` plus one evaluation pass:
/// the deadline is checked after each failed attempt, before sleeping.
pub async fn execute_combined(
    driver: &dyn Driver,
    operator: &str,
    conditions: &[AssertionCondition],
    wait: Option<&WaitConfig>,
) -> Result<AssertionResult, DriverError> {
    if operator != "and" && operator != "or" {
        return Err(DriverError::InvalidArgument(format!(
            "unknown operator {:?}, expected \"and\" or \"or\"",
            operator
        )));
    }
    if conditions.is_empty() {
        return Err(DriverError::InvalidArgument(
            "conditions must not be empty".to_string(),
        ));
    }

    let enabled = wait.map(|w| w.enabled).unwrap_or(false);
    let timeout_ms = wait.map(|w| w.timeout).unwrap_or(DEFAULT_TIMEOUT_MS);
    let interval_ms = wait.map(|w| w.interval).unwrap_or(DEFAULT_INTERVAL_MS);
    if enabled {
        if timeout_ms == 0 {
            return Err(DriverError::InvalidArgument(
                "wait.timeout must be positive".to_string(),
            ));
        }
        if interval_ms == 0 || interval_ms > timeout_ms {
            return Err(DriverError::InvalidArgument(format!(
                "wait.interval must satisfy 0 < interval <= timeout (interval={}, timeout={})",
                interval_ms, timeout_ms
            )));
        }
    }

    let platform = driver.platform();
    let start = Instant::now();
    let deadline = start + Duration::from_millis(timeout_ms);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let mut results = Vec::with_capacity(conditions.len());
        let mut all_details = Vec::with_capacity(conditions.len());
        for (index, condition) in conditions.iter().enumerate() {
            let (success, details) = execute_condition(driver, condition, platform).await;
            results.push(success);
            all_details.push(json!({
                "index": index,
                "type": condition_kind(condition),
                "success": success,
                "details": details,
            }));
        }

        let combined = match operator {
            "and" => results.iter().all(|r| *r),
            _ => results.iter().any(|r| *r),
        };

        let details = json!({
            "conditions": all_details,
            "attempts": attempt,
            "operator": operator,
        });

        if combined {
            return Ok(AssertionResult {
                success: true,
                message: "assertion passed".to_string(),
                details,
            });
        }
        if !enabled {
            return Ok(AssertionResult {
                success: false,
                message: "assertion failed".to_string(),
                details,
            });
        }
        let now = Instant::now();
        if now >= deadline {
            let elapsed_ms = (now - start).as_millis();
            return Ok(AssertionResult {
                success: false,
                message: format!(
                    "timeout after {}ms / {}ms, attempts {}",
                    elapsed_ms, timeout_ms, attempt
                ),
                details,
            });
        }
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

fn condition_kind(condition: &AssertionCondition) -> &'static str {
    match condition {
        AssertionCondition::Element { .. } => "element",
        AssertionCondition::Image { .. } => "image",
    }
}

/// Evaluate one condition; failures inside the check become a `false` result
/// with a reason so or-combined conditions keep working.
async fn execute_condition(
    driver: &dyn Driver,
    condition: &AssertionCondition,
    platform: Platform,
) -> (bool, serde_json::Value) {
    match condition {
        AssertionCondition::Element { selector, expect } => {
            let (found, details) = validate_element_exists(driver, selector, platform).await;
            (apply_expect(found, *expect), details)
        }
        AssertionCondition::Image { template, expect } => {
            let (found, details) = validate_image_exists(driver, template).await;
            (apply_expect(found, *expect), details)
        }
    }
}

fn apply_expect(found: bool, expect: AssertExpect) -> bool {
    match expect {
        AssertExpect::Exists => found,
        AssertExpect::NotExists => !found,
    }
}

/// §element condition: dump, XPath over the raw XML, then exact-match the
/// requested attributes through the platform alias table.
pub async fn validate_element_exists(
    driver: &dyn Driver,
    selector: &ElementSelector,
    platform: Platform,
) -> (bool, serde_json::Value) {
    let xml = match driver.dump_hierarchy().await {
        Ok((xml, _)) => xml,
        Err(e) => {
            return (
                false,
                json!({ "reason": format!("hierarchy dump failed: {}", e), "xpath": selector.xpath }),
            )
        }
    };

    let matches = match xpath_select(&xml, &selector.xpath) {
        Ok(matches) => matches,
        Err(e) => {
            return (
                false,
                json!({ "reason": format!("{}", e), "xpath": selector.xpath }),
            )
        }
    };

    if matches.is_empty() {
        return (
            false,
            json!({ "reason": "xpath found nothing", "xpath": selector.xpath }),
        );
    }

    let wanted: Vec<(&String, &String)> = selector
        .attributes
        .iter()
        .flatten()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k, v)))
        .collect();

    if !wanted.is_empty() {
        let matched = matches.iter().any(|element| {
            wanted.iter().all(|(logical, expected)| {
                match attr_alias(platform, logical) {
                    Some(raw_attr) => {
                        element.attributes.get(raw_attr).map(String::as_str)
                            == Some(expected.as_str())
                    }
                    None => {
                        log::warn!("unknown attribute {:?} (platform: {})", logical, platform);
                        true
                    }
                }
            })
        });
        if !matched {
            return (
                false,
                json!({
                    "reason": "attribute mismatch",
                    "found_count": matches.len(),
                    "xpath": selector.xpath,
                }),
            );
        }
    }

    (
        true,
        json!({ "found_count": matches.len(), "xpath": selector.xpath }),
    )
}

/// §image condition: normalized cross-correlation of the decoded template
/// against the current screenshot.
pub async fn validate_image_exists(
    driver: &dyn Driver,
    template: &ImageTemplate,
) -> (bool, serde_json::Value) {
    let screenshot = match driver.screenshot().await {
        Ok(img) => img.to_rgb8(),
        Err(e) => return (false, json!({ "reason": format!("screenshot failed: {}", e) })),
    };

    // Strip an optional data-url prefix before decoding.
    let b64 = match template.data.split_once(',') {
        Some((head, rest)) if head.starts_with("data:") => rest,
        _ => template.data.as_str(),
    };
    let raw = match base64::engine::general_purpose::STANDARD.decode(b64.trim()) {
        Ok(raw) => raw,
        Err(e) => return (false, json!({ "reason": format!("template is not base64: {}", e) })),
    };
    if raw.len() > MAX_TEMPLATE_SIZE {
        return (
            false,
            json!({
                "reason": format!(
                    "template too large: {:.1}KB (limit {}KB)",
                    raw.len() as f64 / 1024.0,
                    MAX_TEMPLATE_SIZE / 1024
                )
            }),
        );
    }

    let template_img = match image::load_from_memory(&raw) {
        Ok(img) => img.to_rgb8(),
        Err(e) => return (false, json!({ "reason": format!("template decode failed: {}", e) })),
    };

    if template_img.width() > screenshot.width() || template_img.height() > screenshot.height() {
        return (
            false,
            json!({
                "reason": format!(
                    "template size ({}x{}) exceeds screen ({}x{})",
                    template_img.width(),
                    template_img.height(),
                    screenshot.width(),
                    screenshot.height()
                )
            }),
        );
    }

    let (max_val, max_loc) = best_match(
        &image::DynamicImage::ImageRgb8(screenshot).to_luma8(),
        &image::DynamicImage::ImageRgb8(template_img.clone()).to_luma8(),
    );
    let found = max_val as f64 >= template.threshold;
    log::info!(
        "template match: max_val={:.3}, threshold={}",
        max_val,
        template.threshold
    );

    let details = json!({
        "max_confidence": max_val,
        "threshold": template.threshold,
        "location": if found { json!([max_loc.0, max_loc.1]) } else { json!(null) },
        "template_size": format!("{}x{}", template_img.width(), template_img.height()),
    });
    (found, details)
}

/// Peak of the normalized cross-correlation surface: score plus the top-left
/// coordinate of the best placement.
fn best_match(screen: &GrayImage, template: &GrayImage) -> (f32, (u32, u32)) {
    let result = match_template(
        screen,
        template,
        MatchTemplateMethod::CrossCorrelationNormalized,
    );
    let mut max_val = f32::MIN;
    let mut max_loc = (0u32, 0u32);
    for (x, y, pixel) in result.enumerate_pixels() {
        if pixel[0] > max_val {
            max_val = pixel[0];
            max_loc = (x, y);
        }
    }
    (max_val, max_loc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppInfo, CurrentApp, Node, WindowSize};
    use async_trait::async_trait;
    use image::{DynamicImage, RgbImage};

    const LOGIN_XML: &str = r#"<?xml version='1.0' encoding='UTF-8'?>
<hierarchy rotation="0">
  <node index="0" text="Login" resource-id="com.example:id/login_btn"
        class="android.widget.Button" bounds="[100,200][500,300]"/>
</hierarchy>"#;

    /// Test double that serves a fixed hierarchy and screenshot.
    struct FixtureDriver {
        xml: String,
        screen: DynamicImage,
    }

    impl FixtureDriver {
        fn new(xml: &str) -> Self {
            let mut screen = RgbImage::new(64, 64);
            for (x, y, px) in screen.enumerate_pixels_mut() {
                // High-frequency deterministic noise so the correlation peak
                // is unique at the true offset.
                let v = (x.wrapping_mul(31) ^ y.wrapping_mul(57)).wrapping_add(x * y) % 256;
                *px = image::Rgb([v as u8, (v * 3 % 256) as u8, (255 - v) as u8]);
            }
            Self {
                xml: xml.to_string(),
                screen: DynamicImage::ImageRgb8(screen),
            }
        }
    }

    #[async_trait]
    impl Driver for FixtureDriver {
        fn platform(&self) -> Platform {
            Platform::Android
        }
        fn serial(&self) -> &str {
            "fixture"
        }
        async fn tap(&self, _x: i32, _y: i32) -> Result<(), DriverError> {
            Ok(())
        }
        async fn swipe(
            &self,
            _sx: i32,
            _sy: i32,
            _ex: i32,
            _ey: i32,
            _d: f64,
        ) -> Result<(), DriverError> {
            Ok(())
        }
        async fn window_size(&self) -> Result<WindowSize, DriverError> {
            Ok(WindowSize {
                width: 64,
                height: 64,
            })
        }
        async fn screenshot(&self) -> Result<DynamicImage, DriverError> {
            Ok(self.screen.clone())
        }
        async fn dump_hierarchy(&self) -> Result<(String, Node), DriverError> {
            let tree = crate::hierarchy::parse_xml(
                &self.xml,
                Platform::Android,
                WindowSize {
                    width: 64,
                    height: 64,
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

    fn element_condition(xpath: &str, attributes: Option<Vec<(&str, &str)>>) -> AssertionCondition {
        AssertionCondition::Element {
            selector: ElementSelector {
                xpath: xpath.to_string(),
                attributes: attributes.map(|attrs| {
                    attrs
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), Some(v.to_string())))
                        .collect()
                }),
            },
            expect: AssertExpect::Exists,
        }
    }

    fn png_base64(img: &RgbImage) -> String {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(img.clone())
            .write_to(
                &mut std::io::Cursor::new(&mut bytes),
                image::ImageOutputFormat::Png,
            )
            .unwrap();
        base64::engine::general_purpose::STANDARD.encode(&bytes)
    }

    #[tokio::test]
    async fn test_element_assertion_success() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![element_condition(
            "//*[@resource-id='com.example:id/login_btn']",
            Some(vec![("text", "Login")]),
        )];
        let result = execute_combined(&driver, "and", &conditions, None)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.message, "assertion passed");
        assert_eq!(
            result.details["conditions"][0]["details"]["found_count"],
            json!(1)
        );
    }

    #[tokio::test]
    async fn test_attribute_mismatch() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![element_condition(
            "//*[@resource-id='com.example:id/login_btn']",
            Some(vec![("text", "WrongText")]),
        )];
        let result = execute_combined(&driver, "and", &conditions, None)
            .await
            .unwrap();
        assert!(!result.success);
        let details = &result.details["conditions"][0]["details"];
        assert_eq!(details["reason"], json!("attribute mismatch"));
        assert_eq!(details["found_count"], json!(1));
    }

    #[tokio::test]
    async fn test_and_without_wait_is_single_attempt() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![
            element_condition("//*[@resource-id='com.example:id/login_btn']", None),
            element_condition("//*[@resource-id='missing']", None),
        ];
        let result = execute_combined(&driver, "and", &conditions, None)
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.details["attempts"], json!(1));
    }

    #[tokio::test]
    async fn test_or_passes_when_one_matches() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![
            element_condition("//*[@resource-id='missing']", None),
            element_condition("//*[@text='Login']", None),
        ];
        let result = execute_combined(&driver, "or", &conditions, None)
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_retry_until_timeout_bounds() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![element_condition("//*[@resource-id='never']", None)];
        let wait = WaitConfig {
            enabled: true,
            timeout: 500,
            interval: 100,
        };
        let start = std::time::Instant::now();
        let result = execute_combined(&driver, "and", &conditions, Some(&wait))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(!result.success);
        assert!(result.message.starts_with("timeout after"));
        let attempts = result.details["attempts"].as_u64().unwrap();
        assert!(attempts >= 4, "attempts = {}", attempts);
        assert!(elapsed <= Duration::from_millis(700), "elapsed = {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_interval_equal_timeout_single_attempt_before_deadline() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![element_condition("//*[@resource-id='never']", None)];
        let wait = WaitConfig {
            enabled: true,
            timeout: 200,
            interval: 200,
        };
        let result = execute_combined(&driver, "and", &conditions, Some(&wait))
            .await
            .unwrap();
        assert!(!result.success);
        // One attempt fits before the deadline, plus the final one at it.
        let attempts = result.details["attempts"].as_u64().unwrap();
        assert!(attempts <= 2, "attempts = {}", attempts);
    }

    #[tokio::test]
    async fn test_bad_operator_and_empty_conditions() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![element_condition("//*", None)];
        assert!(matches!(
            execute_combined(&driver, "xor", &conditions, None).await,
            Err(DriverError::InvalidArgument(_))
        ));
        assert!(matches!(
            execute_combined(&driver, "and", &[], None).await,
            Err(DriverError::InvalidArgument(_))
        ));
        let wait = WaitConfig {
            enabled: true,
            timeout: 100,
            interval: 200,
        };
        assert!(matches!(
            execute_combined(&driver, "and", &conditions, Some(&wait)).await,
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_image_match_found_and_threshold_one() {
        let driver = FixtureDriver::new(LOGIN_XML);
        // Crop of the gradient screen: an exact sub-image.
        let screen = driver.screen.to_rgb8();
        let crop = image::imageops::crop_imm(&screen, 8, 8, 16, 16).to_image();
        let data = png_base64(&crop);

        let template = ImageTemplate {
            data: data.clone(),
            threshold: 0.95,
            name: None,
        };
        let (found, details) = validate_image_exists(&driver, &template).await;
        assert!(found, "details: {}", details);
        assert_eq!(details["location"], json!([8, 8]));

        // Threshold 0.0 always succeeds for a non-empty template.
        let template = ImageTemplate {
            data,
            threshold: 0.0,
            name: None,
        };
        let (found, _) = validate_image_exists(&driver, &template).await;
        assert!(found);
    }

    #[tokio::test]
    async fn test_template_size_limits() {
        let driver = FixtureDriver::new(LOGIN_XML);

        // Exactly 1 MiB of raw bytes is accepted (fails later on decode,
        // with a decode reason rather than a size reason).
        let exact = base64::engine::general_purpose::STANDARD.encode(vec![0u8; MAX_TEMPLATE_SIZE]);
        let (_, details) = validate_image_exists(
            &driver,
            &ImageTemplate {
                data: exact,
                threshold: 0.5,
                name: None,
            },
        )
        .await;
        assert!(!details["reason"].as_str().unwrap().contains("too large"));

        // One byte over is rejected on size.
        let over =
            base64::engine::general_purpose::STANDARD.encode(vec![0u8; MAX_TEMPLATE_SIZE + 1]);
        let (found, details) = validate_image_exists(
            &driver,
            &ImageTemplate {
                data: over,
                threshold: 0.5,
                name: None,
            },
        )
        .await;
        assert!(!found);
        assert!(details["reason"].as_str().unwrap().contains("too large"));
    }

    #[tokio::test]
    async fn test_template_larger_than_screen_rejected() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let big = RgbImage::new(128, 128);
        let (found, details) = validate_image_exists(
            &driver,
            &ImageTemplate {
                data: png_base64(&big),
                threshold: 0.5,
                name: None,
            },
        )
        .await;
        assert!(!found);
        assert!(details["reason"].as_str().unwrap().contains("exceeds screen"));
    }

    #[tokio::test]
    async fn test_data_url_prefix_is_stripped() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let screen = driver.screen.to_rgb8();
        let crop = image::imageops::crop_imm(&screen, 0, 0, 8, 8).to_image();
        let data = format!("data:image/png;base64,{}", png_base64(&crop));
        let (found, _) = validate_image_exists(
            &driver,
            &ImageTemplate {
                data,
                threshold: 0.9,
                name: None,
            },
        )
        .await;
        assert!(found);
    }

    #[tokio::test]
    async fn test_not_exists_negates() {
        let driver = FixtureDriver::new(LOGIN_XML);
        let conditions = vec![AssertionCondition::Element {
            selector: ElementSelector {
                xpath: "//*[@resource-id='missing']".to_string(),
                attributes: None,
            },
            expect: AssertExpect::NotExists,
        }];
        let result = execute_combined(&driver, "and", &conditions, None)
            .await
            .unwrap();
        assert!(result.success);
    }
}
