//! WebDriverAgent lifecycle supervisor.
//!
//! Per device this owns one shared-tunnel reference, the on-device runner and
//! two port forwards (control HTTP + MJPEG). A background monitor probes all
//! four every 5 seconds and restarts the chain, bounded by a cooldown, when
//! anything dies. All live servers register in a process-global registry so
//! the shutdown hook can close every one on exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{short_udid, IosConfigStore};
use crate::driver::ios::tunnel::TunnelManager;
use crate::error::DriverError;
use crate::supervisor::{port_open, wait_for_port_close, ChildHandle, HelperKind};

/// Default MJPEG port served by the WDA runner.
pub const DEFAULT_MJPEG_PORT: u16 = 9100;

const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const RESTART_COOLDOWN: Duration = Duration::from_secs(10);
const ADOPT_READY_TIMEOUT: Duration = Duration::from_secs(2);
const RUNNER_READY_TIMEOUT: Duration = Duration::from_secs(30);
const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    New,
    Starting,
    Running,
    Restarting,
    Failed,
    Closed,
}

#[derive(Debug, Deserialize)]
struct WdaStatus {
    value: serde_json::Value,
}

#[derive(Default)]
struct Children {
    runner: Option<ChildHandle>,
    forward: Option<ChildHandle>,
    mjpeg_forward: Option<ChildHandle>,
}

struct Monitor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Supervisor for one device's WDA chain.
pub struct WdaServer {
    pub udid: String,
    pub wda_bundle_id: String,
    pub wda_port: u16,
    pub mjpeg_port: u16,

    tunnel: Arc<TunnelManager>,
    children: Mutex<Children>,
    /// At most one start sequence per device. The monitor's restart path runs
    /// without it; the monitor owns restarts.
    start_lock: Mutex<()>,
    monitor: StdMutex<Option<Monitor>>,
    last_restart: StdMutex<Option<Instant>>,
    state: StdMutex<ServerState>,
    closed: AtomicBool,
    http: reqwest::Client,
}

impl WdaServer {
    /// Resolve bundle id and port through the config store (explicit values
    /// are written back, the way the original tool remembers per-device
    /// settings) and register with the process-global registry.
    pub fn new(
        udid: &str,
        wda_bundle_id: Option<String>,
        wda_port: Option<u16>,
        mjpeg_port: Option<u16>,
        tunnel: Arc<TunnelManager>,
        config: Arc<IosConfigStore>,
    ) -> Arc<Self> {
        let bundle_id = match wda_bundle_id {
            Some(id) => {
                let _ = config.set_wda_bundle_id(udid, &id);
                id
            }
            None => config.wda_bundle_id(udid),
        };
        let port = match wda_port {
            Some(p) => {
                let _ = config.set_wda_port(udid, p);
                p
            }
            None => config.wda_port(udid),
        };

        log::info!(
            "WdaServer initialized for {} with bundle_id={}, port={}, mjpeg_port={}",
            short_udid(udid),
            bundle_id,
            port,
            mjpeg_port.unwrap_or(DEFAULT_MJPEG_PORT)
        );

        Arc::new(Self {
            udid: udid.to_string(),
            wda_bundle_id: bundle_id,
            wda_port: port,
            mjpeg_port: mjpeg_port.unwrap_or(DEFAULT_MJPEG_PORT),
            tunnel,
            children: Mutex::new(Children::default()),
            start_lock: Mutex::new(()),
            monitor: StdMutex::new(None),
            last_restart: StdMutex::new(None),
            state: StdMutex::new(ServerState::New),
            closed: AtomicBool::new(false),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(2))
                .build()
                .unwrap_or_default(),
        })
    }

    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Start the WDA chain for this device, under the per-UDID start lock.
    ///
    /// 1. Adopt an already-ready runner (no spawn, no log truncation).
    /// 2. Ensure the shared tunnel.
    /// 3. Kill stale owners of a bound-but-unready control port.
    /// 4. Start both port forwards.
    /// 5. Fast path: ready within 2 s.
    /// 6. Otherwise spawn the runner and wait up to 30 s.
    pub async fn start(self: Arc<Self>) -> Result<(), DriverError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::Fatal(format!(
                "WDA server for {} is already closed",
                short_udid(&self.udid)
            )));
        }
        let _guard = self.start_lock.lock().await;

        if self.is_wda_ready().await {
            log::info!("WDA already running on port {}, adopting", self.wda_port);
            self.tunnel.start_tunnel(&self.udid, false).await?;
            self.set_state(ServerState::Running);
            Self::start_monitor(&self);
            return Ok(());
        }

        self.set_state(ServerState::Starting);
        let start = Instant::now();
        log::info!("starting WDA for device {}", self.udid);

        match self.start_sequence(false).await {
            Ok(()) => {
                log::info!(
                    "WDA started on port {} (total {:.2}s)",
                    self.wda_port,
                    start.elapsed().as_secs_f64()
                );
                self.set_state(ServerState::Running);
                Self::start_monitor(&self);
                Ok(())
            }
            Err(e) => {
                self.set_state(ServerState::Failed);
                self.rollback().await;
                Err(e)
            }
        }
    }

    /// Steps 2–6 of the start sequence, shared by start and restart.
    async fn start_sequence(&self, force_tunnel: bool) -> Result<(), DriverError> {
        self.tunnel.start_tunnel(&self.udid, force_tunnel).await?;

        // A bound control port with no ready runner behind it is a leftover
        // from an earlier run; evict whoever owns it.
        if port_open(self.wda_port, Duration::from_millis(500)).await
            && !self.is_wda_ready().await
        {
            log::warn!(
                "port {} is occupied but WDA is not responding, cleaning up",
                self.wda_port
            );
            cleanup_stale_port_owner(self.wda_port).await;
            wait_for_port_close(self.wda_port, Duration::from_secs(2)).await;
        }

        self.start_forwards().await?;

        if self.wait_for_wda_ready(ADOPT_READY_TIMEOUT).await {
            log::info!("WDA already serving on port {}", self.wda_port);
            return Ok(());
        }

        self.start_runner().await?;
        if !self.wait_for_wda_ready(RUNNER_READY_TIMEOUT).await {
            let tail = {
                let children = self.children.lock().await;
                children
                    .runner
                    .as_ref()
                    .map(|r| r.read_log_tail())
                    .unwrap_or_else(|| "(no runner logs)".to_string())
            };
            let mut msg = format!(
                "WDA failed to become ready within {:?} on port {}\n{}",
                RUNNER_READY_TIMEOUT, self.wda_port, tail
            );
            if tail.contains("did not find test app") {
                msg.push_str(&format!(
                    "\nhint: bundle id {:?} may be wrong for this device",
                    self.wda_bundle_id
                ));
            }
            return Err(DriverError::HelperTimeout(msg));
        }
        Ok(())
    }

    async fn start_forwards(&self) -> Result<(), DriverError> {
        let mut children = self.children.lock().await;

        if children.forward.as_mut().map(|c| c.process_running()) != Some(true) {
            let log_path = std::env::temp_dir().join(format!(
                "wda_forward_{}_{}.log",
                short_udid(&self.udid),
                self.wda_port
            ));
            let args = forward_args(self.wda_port, &self.udid);
            children.forward = Some(
                ChildHandle::spawn(
                    HelperKind::ForwardControl,
                    &self.udid,
                    "ios",
                    &args,
                    log_path,
                    None,
                )
                .await?,
            );
        }

        if children.mjpeg_forward.as_mut().map(|c| c.process_running()) != Some(true) {
            let log_path = std::env::temp_dir().join(format!(
                "wda_mjpeg_forward_{}_{}.log",
                short_udid(&self.udid),
                self.mjpeg_port
            ));
            let args = forward_args(self.mjpeg_port, &self.udid);
            match ChildHandle::spawn(
                HelperKind::ForwardMjpeg,
                &self.udid,
                "ios",
                &args,
                log_path,
                None,
            )
            .await
            {
                Ok(handle) => children.mjpeg_forward = Some(handle),
                // The MJPEG forward is not load-bearing for control traffic.
                Err(e) => log::warn!("MJPEG port forward failed: {}", e),
            }
        }

        Ok(())
    }

    async fn start_runner(&self) -> Result<(), DriverError> {
        let mut children = self.children.lock().await;
        if children.runner.as_mut().map(|c| c.process_running()) == Some(true) {
            return Ok(());
        }
        log::info!("starting WDA runner with bundle id: {}", self.wda_bundle_id);
        let log_path =
            std::env::temp_dir().join(format!("wda_{}.log", short_udid(&self.udid)));
        let args = vec![
            "runwda".to_string(),
            format!("--bundleid={}", self.wda_bundle_id),
            format!("--testrunnerbundleid={}", self.wda_bundle_id),
            "--xctestconfig=WebDriverAgentRunner.xctest".to_string(),
            format!("--udid={}", self.udid),
        ];
        children.runner = Some(
            ChildHandle::spawn(HelperKind::Runner, &self.udid, "ios", &args, log_path, None)
                .await
                .map_err(|e| match e {
                    DriverError::HelperSpawnFailure(msg) => DriverError::HelperSpawnFailure(
                        format!(
                            "{}\ncheck that WDA is installed with bundle id {:?}",
                            msg, self.wda_bundle_id
                        ),
                    ),
                    other => other,
                })?,
        );
        Ok(())
    }

    /// `/status` returns HTTP 200 with a value object containing `ready` or
    /// `state`.
    pub async fn is_wda_ready(&self) -> bool {
        if !port_open(self.wda_port, Duration::from_millis(500)).await {
            return false;
        }
        let url = format!("http://127.0.0.1:{}/status", self.wda_port);
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json::<WdaStatus>().await {
                Ok(status) => status
                    .value
                    .as_object()
                    .map(|v| v.contains_key("ready") || v.contains_key("state"))
                    .unwrap_or(false),
                Err(_) => false,
            },
            _ => false,
        }
    }

    async fn wait_for_wda_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            {
                let mut children = self.children.lock().await;
                if let Some(forward) = children.forward.as_mut() {
                    if !forward.process_running() {
                        log::error!(
                            "port forward died (exit code: {:?})",
                            forward.exit_code()
                        );
                        return false;
                    }
                }
                if let Some(runner) = children.runner.as_mut() {
                    if !runner.process_running() {
                        log::error!("WDA runner died (exit code: {:?})", runner.exit_code());
                        return false;
                    }
                }
            }
            if self.is_wda_ready().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        false
    }

    fn start_monitor(this: &Arc<Self>) {
        let mut slot = this.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(monitor) = slot.as_ref() {
            if !monitor.task.is_finished() {
                return;
            }
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = Arc::clone(this);
        let task = tokio::spawn(async move { server.monitor_loop(stop_rx).await });
        *slot = Some(Monitor { stop: stop_tx, task });
        log::info!("monitor started for device {}", short_udid(&this.udid));
    }

    async fn stop_monitor(&self) {
        let monitor = {
            let mut slot = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(monitor) = monitor {
            let _ = monitor.stop.send(true);
            if tokio::time::timeout(MONITOR_JOIN_TIMEOUT, monitor.task)
                .await
                .is_err()
            {
                log::warn!("monitor for {} did not stop in time", short_udid(&self.udid));
            }
            log::info!("monitor stopped for device {}", short_udid(&self.udid));
        }
    }

    /// Wakes every 5 s and verifies tunnel, runner, control forward and the
    /// `/status` probe. Any failure triggers a cooldown-bounded restart. The
    /// monitor runs without the start lock; it owns restarts.
    async fn monitor_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        log::debug!("monitor loop started for {}", short_udid(&self.udid));
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tokio::time::sleep(MONITOR_INTERVAL) => {}
            }
            if *stop.borrow() {
                break;
            }

            if !self.tunnel.is_tunnel_running(&self.udid).await {
                log::error!("tunnel died for {}, attempting restart", short_udid(&self.udid));
                self.attempt_restart().await;
                continue;
            }

            let mut dead = None;
            {
                let mut children = self.children.lock().await;
                if let Some(runner) = children.runner.as_mut() {
                    if !runner.process_running() {
                        dead = Some(format!("runner (exit code: {:?})", runner.exit_code()));
                    }
                }
                if dead.is_none() {
                    if let Some(forward) = children.forward.as_mut() {
                        if !forward.process_running() {
                            dead = Some(format!(
                                "control forward (exit code: {:?})",
                                forward.exit_code()
                            ));
                        }
                    }
                }
            }
            if let Some(which) = dead {
                log::error!(
                    "{} died for {}, attempting restart",
                    which,
                    short_udid(&self.udid)
                );
                self.attempt_restart().await;
                continue;
            }

            if !self.is_wda_ready().await {
                log::error!(
                    "WDA health check failed for {}, attempting restart",
                    short_udid(&self.udid)
                );
                self.attempt_restart().await;
                continue;
            }

            log::debug!("health check passed for {}", short_udid(&self.udid));
        }
        log::debug!("monitor loop exited for {}", short_udid(&self.udid));
    }

    /// Re-run the start sequence with a forced tunnel restart, guarded by a
    /// 10 s cooldown since the previous attempt.
    async fn attempt_restart(&self) {
        {
            let mut last = self.last_restart.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(at) = *last {
                if at.elapsed() < RESTART_COOLDOWN {
                    log::warn!(
                        "restart cooldown active for {} (last restart {:.1}s ago)",
                        short_udid(&self.udid),
                        at.elapsed().as_secs_f64()
                    );
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        self.set_state(ServerState::Restarting);
        log::info!("attempting WDA restart for {}", short_udid(&self.udid));
        let start = Instant::now();

        self.cleanup_children().await;

        match self.start_sequence(true).await {
            Ok(()) => {
                self.set_state(ServerState::Running);
                log::info!(
                    "WDA restarted for {} (took {:.2}s)",
                    short_udid(&self.udid),
                    start.elapsed().as_secs_f64()
                );
            }
            Err(e) => {
                self.set_state(ServerState::Failed);
                log::error!("failed to restart WDA for {}: {}", short_udid(&self.udid), e);
            }
        }
    }

    /// Terminate every owned child (never the tunnel; that belongs to the
    /// tunnel manager). Log handles close when the handles drop.
    async fn cleanup_children(&self) {
        let mut children = self.children.lock().await;
        for mut child in [
            children.forward.take(),
            children.mjpeg_forward.take(),
            children.runner.take(),
        ]
        .into_iter()
        .flatten()
        {
            child.terminate().await;
        }
    }

    /// Roll back a failed start: children go away and the tunnel reference
    /// taken by this sequence is released.
    async fn rollback(&self) {
        self.cleanup_children().await;
        self.tunnel.release_device(&self.udid).await;
    }

    /// Stop the monitor, terminate owned children and release the tunnel
    /// reference. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("closing WDA server for {}", short_udid(&self.udid));
        self.stop_monitor().await;
        self.cleanup_children().await;
        self.tunnel.release_device(&self.udid).await;
        self.set_state(ServerState::Closed);
        log::info!("WDA server closed for {}", short_udid(&self.udid));
    }
}

fn forward_args(port: u16, udid: &str) -> Vec<String> {
    vec![
        "forward".to_string(),
        port.to_string(),
        port.to_string(),
        format!("--udid={}", udid),
    ]
}

/// Kill whatever owns a local TCP port. macOS uses `lsof`, Linux `fuser`;
/// Windows is left to the user.
async fn cleanup_stale_port_owner(port: u16) {
    if cfg!(target_os = "macos") {
        if let Ok(output) = Command::new("lsof")
            .args(["-ti", &format!(":{}", port)])
            .output()
            .await
        {
            for pid in String::from_utf8_lossy(&output.stdout).split_whitespace() {
                log::info!("killing stale process on port {}: PID {}", port, pid);
                let _ = Command::new("kill").args(["-9", pid]).output().await;
            }
        }
    } else if cfg!(target_os = "linux") {
        log::info!("killing stale processes on port {}", port);
        let _ = Command::new("fuser")
            .args(["-k", &format!("{}/tcp", port)])
            .output()
            .await;
    } else {
        log::warn!("stale port cleanup not supported on this platform");
    }
}

/// Process-global set of live WDA servers, iterated by the shutdown hook.
pub struct ServerRegistry {
    servers: StdMutex<HashMap<String, Arc<WdaServer>>>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            servers: StdMutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, server: Arc<WdaServer>) {
        self.servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(server.udid.clone(), server);
    }

    /// Close every registered server. Called once at process shutdown.
    pub async fn close_all(&self) {
        let servers: Vec<Arc<WdaServer>> = {
            let mut map = self.servers.lock().unwrap_or_else(|e| e.into_inner());
            map.drain().map(|(_, s)| s).collect()
        };
        for server in servers {
            server.close().await;
        }
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Arc<IosConfigStore> {
        let dir = tempfile::tempdir().unwrap();
        // Leak the tempdir so the store outlives the test body.
        let path = dir.into_path();
        Arc::new(IosConfigStore::open(path).unwrap())
    }

    #[tokio::test]
    async fn test_new_resolves_defaults_from_store() {
        let server = WdaServer::new(
            "00008110-TESTUDID",
            None,
            None,
            None,
            Arc::new(TunnelManager::new()),
            test_store(),
        );
        assert_eq!(server.wda_bundle_id, crate::config::DEFAULT_WDA_BUNDLE_ID);
        assert_eq!(server.wda_port, 8100);
        assert_eq!(server.mjpeg_port, DEFAULT_MJPEG_PORT);
        assert_eq!(server.state(), ServerState::New);
    }

    #[tokio::test]
    async fn test_explicit_settings_written_back() {
        let store = test_store();
        let server = WdaServer::new(
            "00008110-TESTUDID",
            Some("com.example.wda".to_string()),
            Some(8111),
            None,
            Arc::new(TunnelManager::new()),
            Arc::clone(&store),
        );
        assert_eq!(server.wda_port, 8111);
        assert_eq!(store.wda_bundle_id("00008110-TESTUDID"), "com.example.wda");
        assert_eq!(store.wda_port("00008110-TESTUDID"), 8111);
    }

    #[tokio::test]
    async fn test_status_probe_rejects_closed_port() {
        let server = WdaServer::new(
            "00008110-TESTUDID",
            None,
            Some(1), // nothing listens here
            None,
            Arc::new(TunnelManager::new()),
            test_store(),
        );
        assert!(!server.is_wda_ready().await);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let server = WdaServer::new(
            "00008110-TESTUDID",
            None,
            None,
            None,
            Arc::new(TunnelManager::new()),
            test_store(),
        );
        server.close().await;
        server.close().await;
        assert_eq!(server.state(), ServerState::Closed);
    }

    #[tokio::test]
    async fn test_registry_close_all_drains() {
        let registry = ServerRegistry::new();
        let server = WdaServer::new(
            "00008110-TESTUDID",
            None,
            None,
            None,
            Arc::new(TunnelManager::new()),
            test_store(),
        );
        registry.register(Arc::clone(&server));
        registry.close_all().await;
        assert_eq!(server.state(), ServerState::Closed);
        assert!(registry
            .servers
            .lock()
            .unwrap()
            .is_empty());
    }
}
