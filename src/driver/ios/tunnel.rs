//! Tunnel lifecycle for iOS 17+ devices.
//!
//! One `ios tunnel start` child per UDID, shared by every consumer of that
//! device (WDA server, screenshot stream) through a reference count. A count
//! that drops to zero keeps the tunnel warm for fast reconnection; tunnels die
//! only on process shutdown or an explicit force restart.

use std::collections::HashMap;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::short_udid;
use crate::error::DriverError;
use crate::supervisor::{ChildHandle, HelperKind};

#[derive(Default)]
struct TunnelEntry {
    /// `None` for a tunnel adopted from the system process table (left over
    /// from a prior run); such tunnels are reused but cannot be terminated
    /// through a handle.
    handle: Option<ChildHandle>,
    refcount: u32,
}

/// Process-scope manager, constructed once at startup and shared via `Arc`.
/// A single coarse mutex protects the per-UDID map; refcount writes happen
/// under it.
pub struct TunnelManager {
    tunnels: Mutex<HashMap<String, TunnelEntry>>,
}

impl TunnelManager {
    pub fn new() -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Start (or reuse) the tunnel for `udid`.
    ///
    /// A live tunnel is reused and its refcount incremented unless `force` is
    /// set, in which case any prior child is terminated first.
    pub async fn start_tunnel(&self, udid: &str, force: bool) -> Result<(), DriverError> {
        let mut tunnels = self.tunnels.lock().await;

        if !force && Self::entry_alive(tunnels.get_mut(udid)).await {
            let entry = tunnels.entry(udid.to_string()).or_default();
            entry.refcount += 1;
            log::info!(
                "tunnel for {} already running, reusing (ref_count: {})",
                short_udid(udid),
                entry.refcount
            );
            return Ok(());
        }
        // Tunnels left by a prior run are reused rather than duplicated.
        if !force && Self::system_tunnel_exists(udid).await {
            let entry = tunnels.entry(udid.to_string()).or_default();
            entry.refcount += 1;
            log::info!(
                "adopting external tunnel for {} (ref_count: {})",
                short_udid(udid),
                entry.refcount
            );
            return Ok(());
        }

        if let Some(mut entry) = tunnels.remove(udid) {
            if let Some(handle) = entry.handle.as_mut() {
                handle.terminate().await;
            }
        }

        log::info!("starting tunnel for {}", short_udid(udid));
        let log_path =
            std::env::temp_dir().join(format!("ios_tunnel_{}.log", short_udid(udid)));
        let args = vec![
            "tunnel".to_string(),
            "start".to_string(),
            format!("--udid={}", udid),
            "--userspace".to_string(),
        ];

        let handle =
            ChildHandle::spawn(HelperKind::Tunnel, udid, "ios", &args, log_path, None).await?;

        log::info!(
            "tunnel started for {} (ref_count: 1, logs: {})",
            short_udid(udid),
            handle.log_path.display()
        );
        tunnels.insert(
            udid.to_string(),
            TunnelEntry {
                handle: Some(handle),
                refcount: 1,
            },
        );
        Ok(())
    }

    async fn entry_alive(entry: Option<&mut TunnelEntry>) -> bool {
        match entry.and_then(|e| e.handle.as_mut()) {
            Some(handle) => handle.is_alive().await,
            None => false,
        }
    }

    async fn system_tunnel_exists(udid: &str) -> bool {
        match Command::new("pgrep")
            .args(["-f", &format!("ios tunnel start.*{}", udid)])
            .output()
            .await
        {
            Ok(output) => output.status.success() && !output.stdout.is_empty(),
            Err(e) => {
                log::debug!("pgrep check failed for {}: {}", short_udid(udid), e);
                false
            }
        }
    }

    /// Check the managed child and then the system process table for a
    /// tunnel keyed by this UDID (covers tunnels from prior runs).
    pub async fn is_tunnel_running(&self, udid: &str) -> bool {
        {
            let mut tunnels = self.tunnels.lock().await;
            if let Some(entry) = tunnels.get_mut(udid) {
                if let Some(handle) = entry.handle.as_mut() {
                    if handle.is_alive().await {
                        return true;
                    }
                    // Our child is gone; forget it but keep the refcount so
                    // consumers stay accounted for across a restart.
                    entry.handle = None;
                }
            }
        }
        Self::system_tunnel_exists(udid).await
    }

    /// Drop one consumer reference. The tunnel stays warm at refcount 0.
    pub async fn release_device(&self, udid: &str) {
        let mut tunnels = self.tunnels.lock().await;
        if let Some(entry) = tunnels.get_mut(udid) {
            entry.refcount = entry.refcount.saturating_sub(1);
            log::debug!(
                "device {} released tunnel (ref_count: {})",
                short_udid(udid),
                entry.refcount
            );
        }
    }

    pub async fn refcount(&self, udid: &str) -> u32 {
        self.tunnels
            .lock()
            .await
            .get(udid)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    /// Terminate all managed tunnels, then best-effort reap orphans left over
    /// from earlier runs.
    pub async fn cleanup(&self) {
        log::info!("cleaning up tunnel manager");
        let mut tunnels = self.tunnels.lock().await;
        for (udid, mut entry) in tunnels.drain() {
            if let Some(handle) = entry.handle.as_mut() {
                handle.terminate().await;
                log::info!("tunnel terminated for {}", short_udid(&udid));
            }
        }
        drop(tunnels);

        match tokio::time::timeout(
            Duration::from_secs(2),
            Command::new("pkill").args(["-f", "ios tunnel start"]).output(),
        )
        .await
        {
            Ok(Ok(_)) => log::info!("cleaned up stale tunnel processes"),
            _ => log::debug!("stale tunnel cleanup skipped"),
        }
    }
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refcount_never_negative() {
        let manager = TunnelManager::new();
        manager.release_device("nope").await;
        assert_eq!(manager.refcount("nope").await, 0);
    }

    #[tokio::test]
    async fn test_unknown_udid_not_running_when_no_process() {
        let manager = TunnelManager::new();
        // No managed child and no system process with this marker string.
        assert!(
            !manager
                .is_tunnel_running("udid-that-certainly-does-not-exist-anywhere")
                .await
        );
    }

    #[tokio::test]
    async fn test_release_then_refcount_tracks_consumers() {
        let manager = TunnelManager::new();
        {
            let mut tunnels = manager.tunnels.lock().await;
            tunnels.insert(
                "u1".to_string(),
                TunnelEntry {
                    handle: None,
                    refcount: 2,
                },
            );
        }
        manager.release_device("u1").await;
        assert_eq!(manager.refcount("u1").await, 1);
        manager.release_device("u1").await;
        manager.release_device("u1").await;
        assert_eq!(manager.refcount("u1").await, 0);
    }
}
