//! MJPEG upstream backed by the helper CLI's screenshot stream
//! (`ios screenshot --stream`). Used when the runner's own MJPEG port is not
//! serving. Shares the device tunnel through the tunnel manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::config::short_udid;
use crate::driver::ios::tunnel::TunnelManager;
use crate::supervisor::{port_open, ChildHandle, HelperKind};

/// Port range probed when the caller did not pin one.
const PORT_SCAN_START: u16 = 3333;
const PORT_SCAN_END: u16 = 3433;
/// How long the stream gets to start serving before we give up.
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(8);

pub struct IosScreenshotStream {
    udid: String,
    tunnel: Arc<TunnelManager>,
    pinned_port: Option<u16>,
    child: Mutex<Option<ChildHandle>>,
    port: Mutex<Option<u16>>,
}

impl IosScreenshotStream {
    pub fn new(udid: &str, tunnel: Arc<TunnelManager>, port: Option<u16>) -> Self {
        log::info!(
            "screenshot stream manager initialized for {} (port: {})",
            short_udid(udid),
            port.map(|p| p.to_string()).unwrap_or_else(|| "<auto>".into())
        );
        Self {
            udid: udid.to_string(),
            tunnel,
            pinned_port: port,
            child: Mutex::new(None),
            port: Mutex::new(None),
        }
    }

    async fn pick_port(&self) -> Option<u16> {
        if let Some(port) = self.pinned_port {
            return Some(port);
        }
        for port in PORT_SCAN_START..PORT_SCAN_END {
            if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
                return Some(port);
            }
        }
        // Fall back to an ephemeral port.
        TcpListener::bind(("127.0.0.1", 0))
            .await
            .ok()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
    }

    /// Start the stream; true when the MJPEG port is serving.
    pub async fn start(&self) -> bool {
        {
            let mut child = self.child.lock().await;
            if let Some(handle) = child.as_mut() {
                if handle.is_alive().await {
                    log::info!("screenshot stream already running");
                    return true;
                }
                *child = None;
            }
        }

        if let Err(e) = self.tunnel.start_tunnel(&self.udid, false).await {
            log::error!("failed to start tunnel for screenshot stream: {}", e);
            return false;
        }

        let port = match self.pick_port().await {
            Some(p) => p,
            None => {
                log::error!("no free port for screenshot stream");
                self.tunnel.release_device(&self.udid).await;
                return false;
            }
        };

        let log_path = std::env::temp_dir().join(format!(
            "ios_screenshot_stream_{}.log",
            short_udid(&self.udid)
        ));
        let args = vec![
            "screenshot".to_string(),
            "--udid".to_string(),
            self.udid.clone(),
            "--stream".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];

        let handle = match ChildHandle::spawn(
            HelperKind::ScreenshotStream,
            &self.udid,
            "ios",
            &args,
            log_path,
            Some(port),
        )
        .await
        {
            Ok(h) => h,
            Err(e) => {
                log::error!("failed to start screenshot stream: {}", e);
                self.tunnel.release_device(&self.udid).await;
                return false;
            }
        };

        // The process being up is not enough; wait for the port to serve.
        let deadline = tokio::time::Instant::now() + STREAM_READY_TIMEOUT;
        let mut handle = handle;
        loop {
            if port_open(port, Duration::from_secs(1)).await {
                break;
            }
            if !handle.process_running() {
                log::error!(
                    "screenshot stream died during startup: {}",
                    handle.read_log_tail()
                );
                self.tunnel.release_device(&self.udid).await;
                return false;
            }
            if tokio::time::Instant::now() >= deadline {
                log::error!("screenshot stream running but port {} not accessible", port);
                handle.terminate().await;
                self.tunnel.release_device(&self.udid).await;
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        log::info!("screenshot stream started and verified on port {}", port);
        *self.child.lock().await = Some(handle);
        *self.port.lock().await = Some(port);
        true
    }

    /// Stop the stream child; the tunnel reference is released but the
    /// tunnel itself stays with the manager.
    pub async fn stop(&self) -> bool {
        let handle = self.child.lock().await.take();
        match handle {
            Some(mut handle) => {
                handle.terminate().await;
                self.tunnel.release_device(&self.udid).await;
                *self.port.lock().await = None;
                log::info!("screenshot stream stopped for {}", short_udid(&self.udid));
                true
            }
            None => true,
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(handle) => {
                if handle.is_alive().await {
                    true
                } else {
                    *child = None;
                    false
                }
            }
            None => false,
        }
    }

    pub async fn mjpeg_url(&self) -> Option<String> {
        let port = (*self.port.lock().await)?;
        Some(format!("http://127.0.0.1:{}", port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_not_running_initially() {
        let stream =
            IosScreenshotStream::new("test-udid", Arc::new(TunnelManager::new()), None);
        assert!(!stream.is_running().await);
        assert!(stream.mjpeg_url().await.is_none());
        // Stopping an idle stream is a successful no-op.
        assert!(stream.stop().await);
    }

    #[tokio::test]
    async fn test_pick_port_prefers_pinned() {
        let stream =
            IosScreenshotStream::new("test-udid", Arc::new(TunnelManager::new()), Some(4555));
        assert_eq!(stream.pick_port().await, Some(4555));
    }

    #[tokio::test]
    async fn test_pick_port_scans_range() {
        let stream = IosScreenshotStream::new("test-udid", Arc::new(TunnelManager::new()), None);
        let port = stream.pick_port().await.unwrap();
        assert!(port >= PORT_SCAN_START || port > 1024);
    }
}
