//! Platform drivers behind one normalized command surface.

pub mod android;
pub mod harmony;
pub mod ios;

use async_trait::async_trait;
use image::DynamicImage;

use crate::error::DriverError;
use crate::model::{AppInfo, CurrentApp, Node, Platform, WindowSize};

pub type DynDriver = std::sync::Arc<dyn Driver>;

/// Platform-agnostic driver interface.
///
/// Implementations talk to their platform supervisor (bridge shell, agent
/// RPC, on-device runner) and normalize coordinates, keys and hierarchy
/// output. All operations may block up to their configured timeout.
#[async_trait]
pub trait Driver: Send + Sync {
    fn platform(&self) -> Platform;

    fn serial(&self) -> &str;

    /// Tap at absolute device-pixel coordinates.
    async fn tap(&self, x: i32, y: i32) -> Result<(), DriverError>;

    /// Swipe between two points over `duration` seconds.
    async fn swipe(
        &self,
        start_x: i32,
        start_y: i32,
        end_x: i32,
        end_y: i32,
        duration: f64,
    ) -> Result<(), DriverError>;

    async fn window_size(&self) -> Result<WindowSize, DriverError>;

    async fn screenshot(&self) -> Result<DynamicImage, DriverError>;

    /// Returns the raw platform XML plus the parsed tree.
    async fn dump_hierarchy(&self) -> Result<(String, Node), DriverError>;

    async fn home(&self) -> Result<(), DriverError>;
    async fn back(&self) -> Result<(), DriverError>;
    async fn app_switch(&self) -> Result<(), DriverError>;
    async fn volume_up(&self) -> Result<(), DriverError>;
    async fn volume_down(&self) -> Result<(), DriverError>;
    async fn volume_mute(&self) -> Result<(), DriverError>;
    async fn wake_up(&self) -> Result<(), DriverError>;

    async fn send_keys(&self, text: &str) -> Result<(), DriverError>;
    async fn clear_text(&self) -> Result<(), DriverError>;

    async fn app_install(&self, url: &str) -> Result<(), DriverError>;
    async fn app_launch(&self, package: &str) -> Result<(), DriverError>;
    async fn app_terminate(&self, package: &str) -> Result<(), DriverError>;
    async fn app_current(&self) -> Result<CurrentApp, DriverError>;
    async fn app_list(&self) -> Result<Vec<AppInfo>, DriverError>;

    /// Ensure a live-screen MJPEG upstream exists; true when reachable.
    async fn start_mjpeg_stream(&self) -> Result<bool, DriverError> {
        Err(DriverError::NotImplemented(format!(
            "mjpeg stream on {}",
            self.platform()
        )))
    }

    async fn stop_mjpeg_stream(&self) -> Result<bool, DriverError> {
        Err(DriverError::NotImplemented(format!(
            "mjpeg stream on {}",
            self.platform()
        )))
    }

    async fn mjpeg_url(&self) -> Option<String> {
        None
    }
}
