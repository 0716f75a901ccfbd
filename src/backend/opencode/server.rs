//! OpenCode server lifecycle
//!
//! Ensures one `opencode serve` process answers on the configured port.
//! A healthy server is reused whoever started it. A server we started in a
//! previous run is found through the pid file and replaced once its command
//! line confirms it is still that server. Anything else squatting on the
//! port is reported as unavailable rather than killed.

use super::client::OpenCodeClient;
use crate::config::OpenCodeConfig;
use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Contents of the pid file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub pid: u32,
    pub port: u16,
    pub host: String,
    /// Unix seconds
    pub started_at: i64,
}

pub struct OpenCodeServer {
    config: OpenCodeConfig,
    pid_file: PathBuf,
    client: OpenCodeClient,
    /// Also serializes startup
    child: Mutex<Option<Child>>,
}

impl OpenCodeServer {
    pub fn new(config: OpenCodeConfig, pid_file: PathBuf) -> Result<Self> {
        let client = OpenCodeClient::new(
            config.base_url(),
            Duration::from_secs(config.request_timeout_secs),
        )?;
        Ok(Self {
            config,
            pid_file,
            client,
            child: Mutex::new(None),
        })
    }

    pub fn client(&self) -> &OpenCodeClient {
        &self.client
    }

    /// Start the server unless a healthy one already answers.
    pub async fn ensure_running(&self) -> Result<()> {
        let mut child = self.child.lock().await;

        if self.client.health().await {
            return Ok(());
        }

        if let Some(mut stale) = child.take() {
            tracing::warn!("Owned OpenCode server is unhealthy, restarting");
            stop_child(&mut stale).await;
            remove_record(&self.pid_file);
        }

        if let Some(record) = read_record(&self.pid_file) {
            if record.port == self.config.port {
                reap_orphan(&record).await;
            }
            remove_record(&self.pid_file);
        }

        if port_in_use(&self.config.host, self.config.port).await {
            return Err(self.unavailable(format!(
                "port {} is in use by an unhealthy process; stop it or configure another port",
                self.config.port
            )));
        }

        let mut spawned = self.spawn()?;
        let pid = spawned.id().unwrap_or(0);
        write_record(
            &self.pid_file,
            &ServerRecord {
                pid,
                port: self.config.port,
                host: self.config.host.clone(),
                started_at: chrono::Utc::now().timestamp(),
            },
        );

        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);
        loop {
            if self.client.health().await {
                tracing::info!(pid, port = self.config.port, "OpenCode server ready");
                *child = Some(spawned);
                return Ok(());
            }
            if let Ok(Some(status)) = spawned.try_wait() {
                remove_record(&self.pid_file);
                return Err(self.unavailable(format!("server exited during startup ({})", status)));
            }
            if tokio::time::Instant::now() >= deadline {
                stop_child(&mut spawned).await;
                remove_record(&self.pid_file);
                return Err(self.unavailable(format!(
                    "server not healthy after {}s",
                    self.config.startup_timeout_secs
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    fn spawn(&self) -> Result<Child> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("serve")
            .arg(format!("--hostname={}", self.config.host))
            .arg(format!("--port={}", self.config.port))
            .env("OPENCODE_ENABLE_EXA", "1")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                self.unavailable(format!("'{}' not found in PATH", self.config.binary))
            } else {
                self.unavailable(format!("failed to spawn: {}", e))
            }
        })
    }

    /// Stop the server if this process started it.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut owned) = child.take() {
            stop_child(&mut owned).await;
            remove_record(&self.pid_file);
            tracing::info!("OpenCode server stopped");
        }
    }

    fn unavailable(&self, reason: String) -> RemoteError {
        RemoteError::BackendUnavailable {
            backend: "opencode".to_string(),
            reason,
        }
    }
}

fn read_record(path: &Path) -> Option<ServerRecord> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Ignoring malformed pid file");
            None
        }
    }
}

fn write_record(path: &Path, record: &ServerRecord) {
    let result = path
        .parent()
        .map(std::fs::create_dir_all)
        .unwrap_or(Ok(()))
        .and_then(|_| {
            let json = serde_json::to_string_pretty(record).map_err(std::io::Error::other)?;
            std::fs::write(path, json)
        });
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "Failed to write pid file");
    }
}

fn remove_record(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove pid file");
        }
    }
}

async fn port_in_use(host: &str, port: u16) -> bool {
    let connect = tokio::net::TcpStream::connect((host, port));
    matches!(
        tokio::time::timeout(Duration::from_millis(500), connect).await,
        Ok(Ok(_))
    )
}

/// SIGTERM, wait for exit, then SIGKILL.
async fn stop_child(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    let _ = child.kill().await;
}

/// Terminate the server a previous run left behind, if the pid still
/// belongs to it. Pids are recycled, so anything else is left alone.
/// Returns whether a signal was sent.
async fn reap_orphan(record: &ServerRecord) -> bool {
    let Some(pid) = pid_from_record(record.pid) else {
        tracing::warn!(pid = record.pid, "Ignoring pid file with invalid pid");
        return false;
    };
    let Some(command) = process_command(pid).await else {
        tracing::debug!(pid, "Orphaned OpenCode server already gone");
        return false;
    };
    if !is_opencode_serve(&command, record.port) {
        tracing::warn!(
            pid,
            port = record.port,
            command = %command,
            "Pid file points at an unrelated process, leaving it running"
        );
        return false;
    }
    tracing::warn!(pid, port = record.port, "Terminating orphaned OpenCode server");
    terminate_pid(pid).await;
    true
}

/// 0 and anything past i32::MAX would address a process group or wrap negative.
fn pid_from_record(pid: u32) -> Option<i32> {
    match i32::try_from(pid) {
        Ok(p) if p > 0 => Some(p),
        _ => None,
    }
}

/// Command line of a live process, space separated.
async fn process_command(pid: i32) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        let raw = tokio::fs::read(format!("/proc/{}/cmdline", pid)).await.ok()?;
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(args.join(" "))
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let output = Command::new("ps")
            .args(["-o", "command=", "-p", &pid.to_string()])
            .output()
            .await
            .ok()?;
        let command = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() && !command.is_empty() {
            Some(command)
        } else {
            None
        }
    }
}

/// Matches the command line [`OpenCodeServer::spawn`] produces for `port`.
fn is_opencode_serve(command: &str, port: u16) -> bool {
    let args: Vec<&str> = command.split_whitespace().collect();
    let Some(serve) = args.iter().position(|a| *a == "serve") else {
        return false;
    };
    if !args[..serve].iter().any(|a| a.contains("opencode")) {
        return false;
    }
    let port = port.to_string();
    args.windows(2).any(|w| w[0] == "--port" && w[1] == port)
        || args
            .iter()
            .any(|a| a.strip_prefix("--port=") == Some(port.as_str()))
}

/// Same as [`stop_child`] for a process we only know by pid.
async fn terminate_pid(pid: i32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        let pid = Pid::from_raw(pid);
        if kill(pid, Signal::SIGTERM).is_err() {
            return;
        }
        let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
        while tokio::time::Instant::now() < deadline {
            if kill(pid, None).is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let _ = kill(pid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        tracing::warn!(pid, "Cannot terminate orphaned OpenCode server on this platform");
    }
}
