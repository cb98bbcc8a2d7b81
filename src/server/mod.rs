//! HTTP/WebSocket application: route assembly, process-wide info endpoints
//! and the shutdown path that closes every supervised helper.

pub mod routes;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;

use crate::model::Platform;
use crate::provider::{Provider, Providers};
use routes::{device_router, DeviceState};

#[derive(Clone)]
pub struct AppState {
    pub providers: Arc<Providers>,
    shutdown: Arc<Notify>,
}

impl AppState {
    pub fn new(providers: Arc<Providers>) -> Self {
        Self {
            providers,
            shutdown: Arc::new(Notify::new()),
        }
    }
}

#[derive(Serialize)]
struct InfoResponse {
    version: String,
    description: String,
    platform: String,
    cwd: String,
    drivers: Vec<String>,
}

async fn info() -> Json<InfoResponse> {
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "ByteAutoUI - Mobile UI Automation Tool".to_string(),
        platform: std::env::consts::OS.to_string(),
        cwd: std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
        drivers: vec!["android".into(), "ios".into(), "harmony".into()],
    })
}

/// Feature map consumed by the frontend to hide unsupported panels.
async fn features(Path(platform): Path<String>) -> Json<HashMap<String, bool>> {
    let mut features = HashMap::new();
    if platform.parse::<Platform>().is_ok() {
        for name in ["screenshot", "hierarchy", "command", "list"] {
            features.insert(name.to_string(), true);
        }
        if platform == "ios" {
            features.insert("ios-config".to_string(), true);
            features.insert("mjpeg".to_string(), true);
        }
    }
    Json(features)
}

/// Local stub replacing the remote version check.
async fn pypi_latest_version() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "version": "0.0.0", "message": "local build" }))
}

async fn shutdown(State(state): State<AppState>) -> &'static str {
    log::info!("shutdown requested over http");
    state.shutdown.notify_waiters();
    "Server shutting down..."
}

async fn android_scrcpy_ws(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let provider = Arc::clone(&state.providers.android);
    ws_stream(upgrade, provider, serial, false).await
}

async fn harmony_mjpeg_ws(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let provider = Arc::clone(&state.providers.harmony);
    ws_stream(upgrade, provider, serial, false).await
}

async fn ios_mjpeg_ws(
    State(state): State<AppState>,
    Path(serial): Path<String>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let provider = Arc::clone(&state.providers.ios);
    ws_stream(upgrade, provider, serial, true).await
}

async fn ws_stream(
    upgrade: WebSocketUpgrade,
    provider: Arc<dyn Provider>,
    serial: String,
    multipart_upstream: bool,
) -> Response {
    match provider.get_device_driver(&serial).await {
        Ok(driver) => upgrade.on_upgrade(move |socket| async move {
            log::info!("websocket stream opened for {}", serial);
            if multipart_upstream {
                stream::mjpeg_ws(socket, driver).await;
            } else {
                stream::screenshot_poll_ws(socket, driver).await;
            }
            log::info!("websocket stream closed for {}", serial);
        }),
        Err(e) => e.into_response(),
    }
}

/// Assemble the full application router.
pub fn build_app(state: AppState) -> Router {
    let providers = &state.providers;

    let android = device_router(DeviceState {
        provider: Arc::clone(&providers.android) as Arc<dyn Provider>,
        ios_config: None,
    });
    let android_adb = device_router(DeviceState {
        provider: Arc::clone(&providers.android_adb) as Arc<dyn Provider>,
        ios_config: None,
    });
    let ios = device_router(DeviceState {
        provider: Arc::clone(&providers.ios) as Arc<dyn Provider>,
        ios_config: Some(Arc::clone(&providers.ios_config)),
    });
    let harmony = device_router(DeviceState {
        provider: Arc::clone(&providers.harmony) as Arc<dyn Provider>,
        ios_config: None,
    });

    Router::new()
        .route("/api/info", get(info))
        .route("/api/:platform/features", get(features))
        .route("/api/pypi/byteautoui/latest-version", get(pypi_latest_version))
        .route("/shutdown", get(shutdown))
        .route("/ws/android/scrcpy/:serial", get(android_scrcpy_ws))
        .route("/ws/harmony/mjpeg/:serial", get(harmony_mjpeg_ws))
        .route("/ws/ios/mjpeg/:serial", get(ios_mjpeg_ws))
        .nest_service("/api/android", android)
        .nest_service("/api/android_adb", android_adb)
        .nest_service("/api/ios", ios)
        .nest_service("/api/harmony", harmony)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until ctrl-c or `/shutdown`, then close every supervised
/// helper (servers first, tunnels last).
pub async fn serve(host: &str, port: u16, providers: Arc<Providers>) -> anyhow::Result<()> {
    let state = AppState::new(Arc::clone(&providers));
    let shutdown = Arc::clone(&state.shutdown);
    let app = build_app(state);

    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => log::info!("ctrl-c received"),
                _ = shutdown.notified() => {}
            }
        })
        .await?;

    log::info!("shutting down byteautoui");
    providers.shutdown().await;
    log::info!("cleanup completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_features_per_platform() {
        let android = features(Path("android".to_string())).await.0;
        assert_eq!(android.get("screenshot"), Some(&true));
        assert!(android.get("mjpeg").is_none());

        let ios = features(Path("ios".to_string())).await.0;
        assert_eq!(ios.get("mjpeg"), Some(&true));
        assert_eq!(ios.get("ios-config"), Some(&true));

        let unknown = features(Path("windows".to_string())).await.0;
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn test_info_shape() {
        let info = info().await.0;
        assert_eq!(info.drivers, vec!["android", "ios", "harmony"]);
        assert!(!info.version.is_empty());
    }
}
