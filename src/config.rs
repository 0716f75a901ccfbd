//! Configuration for a3s-remote
//!
//! Loaded from HCL, or from JSON when the document starts with `{`.
//!
//! ```hcl
//! default_backend = "opencode"
//! platform_backends = { telegram = "claude" }
//!
//! channel "slack_C024BE91L" {
//!   backend     = "claude"
//!   working_dir = "/srv/repos/web"
//! }
//!
//! subagent "reviewer" {
//!   backend = "opencode"
//!   model   = "anthropic/claude-sonnet-4"
//! }
//!
//! poll {
//!   interval_ms           = 2000
//!   question_timeout_secs = 1800
//! }
//! ```

use crate::backend::BackendKind;
use crate::error::{RemoteError, Result};
use crate::identity::ConversationIdentity;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default interval between backend polls.
const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
/// Default time a question may stay unanswered (30 minutes).
const DEFAULT_QUESTION_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_MAX_POLL_FAILURES: u32 = 30;
const DEFAULT_OPENCODE_PORT: u16 = 4096;
const DEFAULT_OPENCODE_HOST: &str = "127.0.0.1";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Backend used when nothing more specific applies
    pub default_backend: String,
    /// Per-platform default backend
    pub platform_backends: HashMap<String, String>,
    /// Per-conversation routing keyed by base session key or channel id
    pub channel: HashMap<String, ChannelRouting>,
    /// Extra subagents keyed by name
    pub subagent: HashMap<String, ConfiguredSubagent>,
    /// Working directory when no channel override exists
    pub default_working_dir: Option<PathBuf>,
    /// Where session files and the OpenCode pid file live
    pub state_dir: Option<PathBuf>,
    pub poll: PollConfig,
    pub opencode: OpenCodeConfig,
    pub claude: CliBackendConfig,
    pub codex: CliBackendConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            default_backend: BackendKind::OpenCode.as_str().to_string(),
            platform_backends: HashMap::new(),
            channel: HashMap::new(),
            subagent: HashMap::new(),
            default_working_dir: None,
            state_dir: None,
            poll: PollConfig::default(),
            opencode: OpenCodeConfig::default(),
            claude: CliBackendConfig::default(),
            codex: CliBackendConfig::default(),
        }
    }
}

/// Per-conversation routing overrides
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelRouting {
    pub backend: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    pub subagent: Option<String>,
    pub reasoning_effort: Option<String>,
}

/// A subagent declared in configuration rather than discovered on disk
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfiguredSubagent {
    pub backend: String,
    pub model: Option<String>,
    pub reasoning_effort: Option<String>,
    pub description: Option<String>,
}

/// Poll-loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub question_timeout_secs: u64,
    /// Consecutive failed polls before the turn is reported as crashed
    pub max_consecutive_poll_failures: u32,
    /// Log a heartbeat every N polls
    pub heartbeat_every: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            question_timeout_secs: DEFAULT_QUESTION_TIMEOUT_SECS,
            max_consecutive_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            heartbeat_every: 5,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn question_timeout(&self) -> Duration {
        Duration::from_secs(self.question_timeout_secs)
    }
}

/// OpenCode server backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenCodeConfig {
    pub enabled: bool,
    pub binary: String,
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    /// Agent used when no subagent or override is given
    pub default_agent: String,
    /// Path to opencode.json (defaults to ~/.config/opencode/opencode.json)
    pub config_path: Option<PathBuf>,
    /// Path to the server pid file (defaults to `<state_dir>/opencode_server.json`)
    pub pid_file: Option<PathBuf>,
}

impl Default for OpenCodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: "opencode".to_string(),
            host: DEFAULT_OPENCODE_HOST.to_string(),
            port: DEFAULT_OPENCODE_PORT,
            request_timeout_secs: 60,
            startup_timeout_secs: 15,
            default_agent: "build".to_string(),
            config_path: None,
            pid_file: None,
        }
    }
}

impl OpenCodeConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(|| {
            home_dir()
                .join(".config")
                .join("opencode")
                .join("opencode.json")
        })
    }
}

/// Subprocess backend (Claude CLI, Codex CLI)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliBackendConfig {
    pub enabled: bool,
    /// Executable override; defaults to the backend's own name
    pub binary: Option<String>,
    /// Extra directories searched for `agents/<name>.md` subagent files
    pub subagent_roots: Vec<PathBuf>,
}

impl Default for CliBackendConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            subagent_roots: Vec::new(),
        }
    }
}

impl RemoteConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RemoteError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            RemoteError::Config(msg) => {
                RemoteError::Config(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })?;
        tracing::debug!(path = %path.display(), "Config loaded");
        Ok(config)
    }

    /// Parse HCL, or JSON when the content starts with `{`.
    pub fn parse(content: &str) -> Result<Self> {
        let config: RemoteConfig = if content.trim_start().starts_with('{') {
            serde_json::from_str(content)
                .map_err(|e| RemoteError::Config(format!("Failed to parse JSON config: {}", e)))?
        } else {
            hcl::from_str(content)
                .map_err(|e| RemoteError::Config(format!("Failed to parse HCL config: {}", e)))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.default_backend
            .parse::<BackendKind>()
            .map_err(|_| {
                RemoteError::Config(format!("Unknown default_backend '{}'", self.default_backend))
            })?;

        for (platform, backend) in &self.platform_backends {
            backend.parse::<BackendKind>().map_err(|_| {
                RemoteError::Config(format!(
                    "Unknown backend '{}' for platform '{}'",
                    backend, platform
                ))
            })?;
        }

        for (name, sub) in &self.subagent {
            sub.backend.parse::<BackendKind>().map_err(|_| {
                RemoteError::Config(format!(
                    "Subagent '{}' references unknown backend '{}'",
                    name, sub.backend
                ))
            })?;
        }

        if self.poll.interval_ms == 0 {
            return Err(RemoteError::Config("poll.interval_ms must be > 0".into()));
        }
        if self.poll.question_timeout_secs == 0 {
            return Err(RemoteError::Config(
                "poll.question_timeout_secs must be > 0".into(),
            ));
        }
        if self.poll.max_consecutive_poll_failures == 0 {
            return Err(RemoteError::Config(
                "poll.max_consecutive_poll_failures must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Routing overrides for a conversation: exact base key first, then channel id.
    pub fn channel_for(&self, identity: &ConversationIdentity) -> Option<&ChannelRouting> {
        self.channel
            .get(&identity.base_session_key())
            .or_else(|| self.channel.get(&identity.channel_id))
    }

    pub fn backend_enabled(&self, kind: BackendKind) -> bool {
        match kind {
            BackendKind::Claude => self.claude.enabled,
            BackendKind::Codex => self.codex.enabled,
            BackendKind::OpenCode => self.opencode.enabled,
        }
    }

    pub fn cli_config(&self, kind: BackendKind) -> Option<&CliBackendConfig> {
        match kind {
            BackendKind::Claude => Some(&self.claude),
            BackendKind::Codex => Some(&self.codex),
            BackendKind::OpenCode => None,
        }
    }

    /// `~/.a3s-remote` unless overridden
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| home_dir().join(".a3s-remote"))
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.state_dir().join("sessions")
    }

    pub fn opencode_pid_file(&self) -> PathBuf {
        self.opencode
            .pid_file
            .clone()
            .unwrap_or_else(|| self.state_dir().join("opencode_server.json"))
    }

    pub fn default_working_dir(&self) -> PathBuf {
        self.default_working_dir.clone().unwrap_or_else(home_dir)
    }
}

fn home_dir() -> PathBuf {
    dirs_next::home_dir().unwrap_or_else(|| PathBuf::from("."))
}
