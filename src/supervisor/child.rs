//! A supervised helper process: spawned with its output routed to a log file,
//! checked for immediate death, liveness-probed through its TCP port, and
//! terminated politely before being killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

use crate::error::DriverError;

/// How long to wait after spawn before declaring the child viable.
const SPAWN_GRACE: Duration = Duration::from_millis(300);
/// Polite-termination window before SIGKILL.
const TERMINATE_WAIT: Duration = Duration::from_secs(2);
/// Lines of helper output embedded into spawn-failure messages.
const LOG_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperKind {
    Tunnel,
    Runner,
    ForwardControl,
    ForwardMjpeg,
    ScreenshotStream,
}

impl HelperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HelperKind::Tunnel => "tunnel",
            HelperKind::Runner => "runner",
            HelperKind::ForwardControl => "forward-control",
            HelperKind::ForwardMjpeg => "forward-mjpeg",
            HelperKind::ScreenshotStream => "screenshot-stream",
        }
    }
}

/// Handle to one spawned helper. Owned by the supervisor that spawned it and
/// destroyed only through the stop/release paths.
#[derive(Debug)]
pub struct ChildHandle {
    pub kind: HelperKind,
    pub udid: String,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Primary TCP port, when the helper serves one; folded into liveness.
    pub port: Option<u16>,
    child: Child,
    exit_code: Option<i32>,
}

impl ChildHandle {
    /// Spawn `program args...` with stdout and stderr routed into `log_path`
    /// (truncated first). Waits a short grace period and fails with the log
    /// tail embedded if the child died immediately.
    pub async fn spawn(
        kind: HelperKind,
        udid: &str,
        program: &str,
        args: &[String],
        log_path: PathBuf,
        port: Option<u16>,
    ) -> Result<Self, DriverError> {
        let log_file = std::fs::File::create(&log_path)
            .with_context(|| format!("failed to open log file {}", log_path.display()))
            .map_err(DriverError::Other)?;
        let stderr_file = log_file
            .try_clone()
            .context("failed to clone log handle")
            .map_err(DriverError::Other)?;

        log::info!(
            "spawning {} for {}: {} {}",
            kind.as_str(),
            udid,
            program,
            args.join(" ")
        );

        let child = Command::new(program)
            .args(args)
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .with_context(|| format!("failed to spawn {} ({})", kind.as_str(), program))
            .map_err(DriverError::Other)?;

        let mut handle = Self {
            kind,
            udid: udid.to_string(),
            log_path,
            started_at: Utc::now(),
            port,
            child,
            exit_code: None,
        };

        tokio::time::sleep(SPAWN_GRACE).await;

        if let Ok(Some(status)) = handle.child.try_wait() {
            handle.exit_code = status.code();
            let tail = log_tail(&handle.log_path, LOG_TAIL_LINES);
            return Err(DriverError::HelperSpawnFailure(format!(
                "{} for {} exited during startup (code: {:?}, logs: {})\n{}",
                kind.as_str(),
                udid,
                status.code(),
                handle.log_path.display(),
                tail
            )));
        }

        Ok(handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// The child is alive when the process is still running and, if it serves
    /// a TCP port, that port accepts connections.
    pub async fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = status.code();
                false
            }
            Ok(None) => match self.port {
                Some(port) => port_open(port, Duration::from_millis(500)).await,
                None => true,
            },
            Err(_) => false,
        }
    }

    /// True when the process itself is running, ignoring the port probe.
    pub fn process_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        if let Ok(Some(status)) = self.child.try_wait() {
            self.exit_code = status.code();
        }
        self.exit_code
    }

    /// SIGTERM, wait up to 2 s, then SIGKILL. Safe to call more than once.
    pub async fn terminate(&mut self) {
        if !self.process_running() {
            return;
        }
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            match tokio::time::timeout(TERMINATE_WAIT, self.child.wait()).await {
                Ok(Ok(status)) => {
                    self.exit_code = status.code();
                    log::info!(
                        "{} for {} terminated (code: {:?})",
                        self.kind.as_str(),
                        self.udid,
                        status.code()
                    );
                    return;
                }
                Ok(Err(e)) => log::debug!("wait after SIGTERM failed: {}", e),
                Err(_) => log::warn!(
                    "{} for {} did not exit within {:?}, killing",
                    self.kind.as_str(),
                    self.udid,
                    TERMINATE_WAIT
                ),
            }
        }
        let _ = self.child.start_kill();
        if let Ok(status) = self.child.wait().await {
            self.exit_code = status.code();
        }
    }

    /// Tail of this helper's log, for diagnostics.
    pub fn read_log_tail(&self) -> String {
        log_tail(&self.log_path, LOG_TAIL_LINES)
    }
}

/// Last `lines` lines of a log file, or a placeholder when unreadable.
pub fn log_tail(path: &Path, lines: usize) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            all[start..].join("\n")
        }
        Ok(_) => "(no logs)".to_string(),
        Err(_) => "(failed to read logs)".to_string(),
    }
}

/// Check whether `127.0.0.1:port` accepts connections.
pub async fn port_open(port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Wait for a local port to stop accepting connections.
pub async fn wait_for_port_close(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !port_open(port, Duration::from_millis(100)).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_log(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("byteautoui_test_{}.log", name))
    }

    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let log = tmp_log("sleep");
        let mut handle = ChildHandle::spawn(
            HelperKind::Runner,
            "test-udid",
            "sleep",
            &["30".to_string()],
            log.clone(),
            None,
        )
        .await
        .unwrap();
        assert!(handle.is_alive().await);
        handle.terminate().await;
        assert!(!handle.is_alive().await);
        // Idempotent.
        handle.terminate().await;
        let _ = std::fs::remove_file(log);
    }

    #[tokio::test]
    async fn test_immediate_death_embeds_log_tail() {
        let log = tmp_log("false");
        let err = ChildHandle::spawn(
            HelperKind::Tunnel,
            "test-udid",
            "sh",
            &["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            log.clone(),
            None,
        )
        .await
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited during startup"), "got: {}", msg);
        assert!(msg.contains("boom"), "log tail missing: {}", msg);
        let _ = std::fs::remove_file(log);
    }

    #[tokio::test]
    async fn test_log_truncated_on_start() {
        let log = tmp_log("truncate");
        std::fs::write(&log, "stale content from a previous run\n").unwrap();
        let mut handle = ChildHandle::spawn(
            HelperKind::ForwardControl,
            "test-udid",
            "sh",
            &["-c".to_string(), "echo fresh; sleep 5".to_string()],
            log.clone(),
            None,
        )
        .await
        .unwrap();
        let content = std::fs::read_to_string(&log).unwrap();
        assert!(!content.contains("stale content"));
        handle.terminate().await;
        let _ = std::fs::remove_file(log);
    }

    #[tokio::test]
    async fn test_port_probe_folds_into_liveness() {
        // A process that is alive but never binds its port is not "alive".
        let log = tmp_log("port");
        let mut handle = ChildHandle::spawn(
            HelperKind::ForwardControl,
            "test-udid",
            "sleep",
            &["5".to_string()],
            log.clone(),
            Some(1), // nothing listens on port 1
        )
        .await
        .unwrap();
        assert!(!handle.is_alive().await);
        assert!(handle.process_running());
        handle.terminate().await;
        let _ = std::fs::remove_file(log);
    }

    #[test]
    fn test_log_tail_last_lines() {
        let log = tmp_log("tail");
        let body: String = (0..20).map(|i| format!("line{}\n", i)).collect();
        std::fs::write(&log, body).unwrap();
        let tail = log_tail(&log, 10);
        assert!(tail.starts_with("line10"));
        assert!(tail.ends_with("line19"));
        let _ = std::fs::remove_file(log);
    }
}
