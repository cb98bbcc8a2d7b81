//! Per-platform device routes: list, screenshot, hierarchy, command
//! dispatch, and the iOS-only config and MJPEG endpoints.

use std::io::Cursor;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::stream;
use crate::command::{self, Command};
use crate::config::IosConfigStore;
use crate::error::DriverError;
use crate::provider::Provider;

#[derive(Clone)]
pub struct DeviceState {
    pub provider: Arc<dyn Provider>,
    /// Present only on the iOS router; gates the iOS-only endpoints.
    pub ios_config: Option<Arc<IosConfigStore>>,
}

/// Build the router mounted under `/api/{platform}`.
pub fn device_router(state: DeviceState) -> Router {
    let mut router = Router::new()
        .route("/list", get(list_devices))
        .route("/:serial/screenshot/:id", get(screenshot))
        .route("/:serial/hierarchy", get(hierarchy))
        .route("/:serial/command/:command", post(run_command));

    if state.ios_config.is_some() {
        router = router
            .route(
                "/:serial/ios-config",
                get(get_ios_config).post(set_ios_config),
            )
            .route("/:serial/mjpeg", get(mjpeg_proxy));
    }

    router.with_state(state)
}

async fn list_devices(State(state): State<DeviceState>) -> Response {
    match state.provider.list_devices().await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn screenshot(
    State(state): State<DeviceState>,
    Path((serial, _id)): Path<(String, u32)>,
) -> Response {
    let result = async {
        let driver = state.provider.get_device_driver(&serial).await?;
        let img = driver.screenshot().await?.to_rgb8();
        let mut jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(
                &mut Cursor::new(&mut jpeg),
                image::ImageOutputFormat::Jpeg(90),
            )
            .map_err(|e| DriverError::Other(anyhow::anyhow!("jpeg encode failed: {}", e)))?;
        Ok::<_, DriverError>(jpeg)
    }
    .await;

    match result {
        Ok(jpeg) => ([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct HierarchyQuery {
    #[serde(default = "default_format")]
    format: String,
}

fn default_format() -> String {
    "json".to_string()
}

async fn hierarchy(
    State(state): State<DeviceState>,
    Path(serial): Path<String>,
    Query(query): Query<HierarchyQuery>,
) -> Response {
    let result = async {
        let driver = state.provider.get_device_driver(&serial).await?;
        let (xml, tree) = driver.dump_hierarchy().await?;
        match query.format.as_str() {
            "xml" => Ok(([(header::CONTENT_TYPE, "text/xml")], xml).into_response()),
            "json" => {
                let wsize = driver.window_size().await?;
                let mut value = serde_json::to_value(&tree)
                    .map_err(|e| DriverError::Other(e.into()))?;
                if let Some(obj) = value.as_object_mut() {
                    obj.insert("width".to_string(), wsize.width.into());
                    obj.insert("height".to_string(), wsize.height.into());
                }
                Ok(Json(value).into_response())
            }
            other => Err(DriverError::InvalidArgument(format!(
                "invalid format: {}",
                other
            ))),
        }
    }
    .await;

    result.unwrap_or_else(|e: DriverError| e.into_response())
}

async fn run_command(
    State(state): State<DeviceState>,
    Path((serial, command)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let command = Command::parse(&command)
            .ok_or_else(|| DriverError::NotImplemented(format!("command {}", command)))?;

        let params = if body.is_empty() {
            None
        } else {
            let value: serde_json::Value = serde_json::from_slice(&body).map_err(|e| {
                DriverError::InvalidArgument(format!("request body is not json: {}", e))
            })?;
            if value.is_null() {
                None
            } else {
                Some(value)
            }
        };

        let driver = state.provider.get_device_driver(&serial).await?;
        command::send_command(driver.as_ref(), command, params).await
    }
    .await;

    match result {
        Ok(value) => Json(value).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct IosConfigRequest {
    wda_bundle_id: Option<String>,
    wda_port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct IosConfigResponse {
    wda_bundle_id: String,
    wda_port: u16,
}

async fn get_ios_config(
    State(state): State<DeviceState>,
    Path(serial): Path<String>,
) -> Response {
    match state.ios_config.as_ref() {
        Some(config) => {
            let (wda_bundle_id, wda_port) = config.device_config(&serial);
            Json(IosConfigResponse {
                wda_bundle_id,
                wda_port,
            })
            .into_response()
        }
        None => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn set_ios_config(
    State(state): State<DeviceState>,
    Path(serial): Path<String>,
    Json(request): Json<IosConfigRequest>,
) -> Response {
    let config = match state.ios_config.as_ref() {
        Some(config) => config,
        None => return StatusCode::NOT_IMPLEMENTED.into_response(),
    };

    if let Some(bundle_id) = &request.wda_bundle_id {
        if let Err(e) = config.set_wda_bundle_id(&serial, bundle_id) {
            return DriverError::Other(e).into_response();
        }
    }
    if let Some(port) = request.wda_port {
        if let Err(e) = config.set_wda_port(&serial, port) {
            return DriverError::Other(e).into_response();
        }
    }

    let (wda_bundle_id, wda_port) = config.device_config(&serial);
    Json(IosConfigResponse {
        wda_bundle_id,
        wda_port,
    })
    .into_response()
}

async fn mjpeg_proxy(
    State(state): State<DeviceState>,
    Path(serial): Path<String>,
) -> Response {
    let result = async {
        let driver = state.provider.get_device_driver(&serial).await?;
        stream::mjpeg_proxy_response(driver).await
    }
    .await;
    result.unwrap_or_else(|e| e.into_response())
}
