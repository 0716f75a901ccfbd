//! Backend adapters
//!
//! Every agent executor sits behind [`AgentBackend`]. The set of executors is
//! closed ([`BackendKind`]): two single-shot CLI subprocesses and the OpenCode
//! HTTP server, which is the only one able to pause a turn for a question.

pub mod cli;
pub mod opencode;

use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::session::Session;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub use cli::CliBackend;
pub use opencode::OpenCodeBackend;

/// Supported agent executors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Claude,
    Codex,
    OpenCode,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Claude, BackendKind::Codex, BackendKind::OpenCode];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Claude => "claude",
            BackendKind::Codex => "codex",
            BackendKind::OpenCode => "opencode",
        }
    }

    /// Only server-backed executors can pause mid-turn for input.
    pub fn supports_questions(&self) -> bool {
        matches!(self, BackendKind::OpenCode)
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "claude-code" | "claude_code" => Ok(BackendKind::Claude),
            "codex" => Ok(BackendKind::Codex),
            "opencode" | "open-code" => Ok(BackendKind::OpenCode),
            other => Err(RemoteError::Routing(format!("Unknown backend '{}'", other))),
        }
    }
}

/// Per-prompt overrides resolved by the router
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOptions {
    pub model: Option<String>,
    pub subagent: Option<String>,
    pub reasoning_effort: Option<String>,
}

/// One in-flight turn against a backend session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnHandle {
    pub backend: BackendKind,
    /// Local id for this turn
    pub turn_id: String,
    /// Backend-native session id, when the backend knows it up front
    pub session_id: Option<String>,
    pub working_dir: PathBuf,
}

impl TurnHandle {
    pub fn new(backend: BackendKind, session_id: Option<String>, working_dir: PathBuf) -> Self {
        Self {
            backend,
            turn_id: uuid::Uuid::new_v4().to_string(),
            session_id,
            working_dir,
        }
    }
}

/// One option offered by a backend question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl QuestionOption {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            description: None,
        }
    }
}

/// An awaiting-input tool call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendQuestion {
    pub call_id: String,
    pub text: String,
    pub options: Vec<QuestionOption>,
    /// Backend already considers the question answered
    pub completed: bool,
}

/// Incremental output from a poll. Every variant carries a stable id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    AssistantText {
        id: String,
        text: String,
    },
    ToolCall {
        call_id: String,
        tool: String,
        summary: String,
    },
    Question(BackendQuestion),
    TurnFinished {
        id: String,
        text: String,
        /// Session id assigned by the backend, if it only became known now
        session_id: Option<String>,
    },
    /// The turn died; no further events will follow
    Failed {
        id: String,
        reason: String,
    },
}

impl BackendEvent {
    pub fn event_id(&self) -> &str {
        match self {
            BackendEvent::AssistantText { id, .. } => id,
            BackendEvent::ToolCall { call_id, .. } => call_id,
            BackendEvent::Question(q) => &q.call_id,
            BackendEvent::TurnFinished { id, .. } => id,
            BackendEvent::Failed { id, .. } => id,
        }
    }
}

/// Uniform contract over agent executors
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn supports_questions(&self) -> bool {
        self.kind().supports_questions()
    }

    /// Send a prompt, creating the backend session when the Session has none.
    async fn start_or_continue(
        &self,
        session: &Session,
        prompt: &str,
        options: &PromptOptions,
    ) -> Result<TurnHandle>;

    /// Events produced since the turn started. Repeated polls may return
    /// events already seen; callers deduplicate by [`BackendEvent::event_id`].
    async fn poll_incremental(&self, turn: &TurnHandle) -> Result<Vec<BackendEvent>>;

    async fn submit_answer(&self, turn: &TurnHandle, call_id: &str, answer: &str) -> Result<()> {
        let _ = (turn, answer);
        Err(RemoteError::SubmissionFailure {
            call_id: call_id.to_string(),
            reason: format!("{} does not support interactive questions", self.kind()),
        })
    }

    /// Best-effort cancellation of the running turn.
    async fn interrupt(&self, turn: &TurnHandle) -> Result<()>;

    /// Drop per-turn bookkeeping once the poll loop is done with it.
    fn release(&self, _turn: &TurnHandle) {}

    /// Stop any process the backend owns.
    async fn shutdown(&self) {}
}

/// The backends available to the orchestrator
#[derive(Default, Clone)]
pub struct BackendSet {
    backends: HashMap<BackendKind, Arc<dyn AgentBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the enabled backends from configuration.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let mut set = Self::new();
        for kind in [BackendKind::Claude, BackendKind::Codex] {
            if let Some(cli) = config.cli_config(kind).filter(|c| c.enabled) {
                set.insert(Arc::new(CliBackend::new(kind, cli.binary.clone())?));
            }
        }
        if config.opencode.enabled {
            set.insert(Arc::new(OpenCodeBackend::from_config(config)?));
        }
        Ok(set)
    }

    pub fn with(mut self, backend: Arc<dyn AgentBackend>) -> Self {
        self.insert(backend);
        self
    }

    pub fn insert(&mut self, backend: Arc<dyn AgentBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: BackendKind) -> Result<Arc<dyn AgentBackend>> {
        self.backends
            .get(&kind)
            .cloned()
            .ok_or_else(|| RemoteError::BackendUnavailable {
                backend: kind.to_string(),
                reason: "backend is not configured".to_string(),
            })
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
