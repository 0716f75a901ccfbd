//! Single-shot subprocess backends (Claude CLI, Codex CLI)
//!
//! Each turn runs one process to completion in the session's working
//! directory. Polling reports nothing until the process exits, then a single
//! `TurnFinished`. Questions are not supported.

use super::{AgentBackend, BackendEvent, BackendKind, PromptOptions, TurnHandle};
use crate::error::{RemoteError, Result};
use crate::session::Session;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Longest stderr excerpt carried into an error message.
const STDERR_EXCERPT: usize = 500;

struct CliTurn {
    task: JoinHandle<std::io::Result<Output>>,
}

/// Parsed result of one CLI run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOutput {
    pub text: String,
    pub session_id: Option<String>,
}

pub struct CliBackend {
    kind: BackendKind,
    binary: String,
    turns: DashMap<String, CliTurn>,
}

impl CliBackend {
    /// `binary` defaults to the backend name (`claude`, `codex`).
    pub fn new(kind: BackendKind, binary: Option<String>) -> Result<Self> {
        if kind == BackendKind::OpenCode {
            return Err(RemoteError::Config(
                "OpenCode is a server backend, not a CLI backend".into(),
            ));
        }
        Ok(Self {
            kind,
            binary: binary.unwrap_or_else(|| kind.as_str().to_string()),
            turns: DashMap::new(),
        })
    }

    fn args(&self, prompt: &str, session: &Session, options: &PromptOptions) -> (Vec<String>, Option<String>) {
        match self.kind {
            BackendKind::Codex => (codex_args(prompt, session.backend_session_id(), options), None),
            _ => match session.backend_session_id() {
                Some(id) => (claude_args(prompt, ClaudeSession::Resume(id), options), Some(id.to_string())),
                None => {
                    let id = uuid::Uuid::new_v4().to_string();
                    (claude_args(prompt, ClaudeSession::New(&id), options), Some(id))
                }
            },
        }
    }

    fn parse(&self, stdout: &str) -> Result<CliOutput> {
        match self.kind {
            BackendKind::Codex => parse_codex_output(stdout),
            _ => parse_claude_output(stdout),
        }
    }

    /// Wait out a finished process and parse what it printed.
    async fn collect(&self, turn: CliTurn) -> Result<CliOutput> {
        let output = turn
            .task
            .await
            .map_err(|e| self.crash(format!("process task failed: {}", e)))?
            .map_err(|e| self.crash(format!("process wait failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let excerpt: String = stderr.trim().chars().take(STDERR_EXCERPT).collect();
            return Err(self.crash(format!("exited with {}: {}", output.status, excerpt)));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        self.parse(&stdout)
            .map_err(|e| match e {
                RemoteError::Serialization(err) => self.crash(format!("unreadable output: {}", err)),
                other => other,
            })
    }

    fn crash(&self, reason: impl Into<String>) -> RemoteError {
        RemoteError::BackendCrash {
            backend: self.kind.to_string(),
            reason: reason.into(),
        }
    }
}

pub enum ClaudeSession<'a> {
    New(&'a str),
    Resume(&'a str),
}

/// `claude -p <prompt> --output-format json ...`
pub fn claude_args(prompt: &str, session: ClaudeSession<'_>, options: &PromptOptions) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        prompt.to_string(),
        "--output-format".to_string(),
        "json".to_string(),
    ];
    match session {
        ClaudeSession::New(id) => args.extend(["--session-id".to_string(), id.to_string()]),
        ClaudeSession::Resume(id) => args.extend(["--resume".to_string(), id.to_string()]),
    }
    if let Some(model) = &options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if let Some(subagent) = &options.subagent {
        args.extend([
            "--append-system-prompt".to_string(),
            format!("Delegate this task to the `{}` subagent.", subagent),
        ]);
    }
    args
}

/// `codex exec --json ...` or `codex exec --json resume <thread> ...`
pub fn codex_args(prompt: &str, thread_id: Option<&str>, options: &PromptOptions) -> Vec<String> {
    let mut args = vec![
        "exec".to_string(),
        "--json".to_string(),
        "--skip-git-repo-check".to_string(),
    ];
    if let Some(model) = &options.model {
        args.extend(["--model".to_string(), model.clone()]);
    }
    if let Some(effort) = &options.reasoning_effort {
        args.extend(["-c".to_string(), format!("model_reasoning_effort={}", effort)]);
    }
    if let Some(thread) = thread_id {
        args.extend(["resume".to_string(), thread.to_string()]);
    }
    args.push(prompt.to_string());
    args
}

#[derive(Debug, Deserialize)]
struct ClaudeResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
}

pub fn parse_claude_output(stdout: &str) -> Result<CliOutput> {
    let parsed: ClaudeResult = serde_json::from_str(stdout.trim())?;
    let text = parsed.result.unwrap_or_default();
    if parsed.is_error {
        return Err(RemoteError::BackendCrash {
            backend: BackendKind::Claude.to_string(),
            reason: text,
        });
    }
    Ok(CliOutput {
        text,
        session_id: parsed.session_id,
    })
}

/// Scan Codex JSONL: `thread.started` carries the thread id, the last
/// completed `agent_message` item is the answer.
pub fn parse_codex_output(stdout: &str) -> Result<CliOutput> {
    let mut session_id = None;
    let mut text = None;
    for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        let Ok(event) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        match event.get("type").and_then(|t| t.as_str()) {
            Some("thread.started") => {
                session_id = event
                    .get("thread_id")
                    .and_then(|t| t.as_str())
                    .map(str::to_string);
            }
            Some("item.completed") => {
                let item = &event["item"];
                let item_type = item
                    .get("type")
                    .or_else(|| item.get("item_type"))
                    .and_then(|t| t.as_str());
                if item_type == Some("agent_message") {
                    text = item.get("text").and_then(|t| t.as_str()).map(str::to_string);
                }
            }
            Some("turn.failed") | Some("error") => {
                let message = event
                    .pointer("/error/message")
                    .or_else(|| event.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("turn failed");
                return Err(RemoteError::BackendCrash {
                    backend: BackendKind::Codex.to_string(),
                    reason: message.to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(CliOutput {
        text: text.unwrap_or_default(),
        session_id,
    })
}

#[async_trait]
impl AgentBackend for CliBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start_or_continue(
        &self,
        session: &Session,
        prompt: &str,
        options: &PromptOptions,
    ) -> Result<TurnHandle> {
        let (args, session_id) = self.args(prompt, session, options);

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .current_dir(&session.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| RemoteError::BackendUnavailable {
            backend: self.kind.to_string(),
            reason: if e.kind() == std::io::ErrorKind::NotFound {
                format!("'{}' not found in PATH", self.binary)
            } else {
                e.to_string()
            },
        })?;
        tracing::info!(
            backend = %self.kind,
            pid = child.id().unwrap_or(0),
            working_dir = %session.working_dir.display(),
            resume = session.backend_session_id().is_some(),
            "Agent process started"
        );

        let handle = TurnHandle::new(self.kind, session_id, session.working_dir.clone());
        let task = tokio::spawn(child.wait_with_output());
        self.turns.insert(handle.turn_id.clone(), CliTurn { task });
        Ok(handle)
    }

    async fn poll_incremental(&self, turn: &TurnHandle) -> Result<Vec<BackendEvent>> {
        let finished = self
            .turns
            .get(&turn.turn_id)
            .map(|t| t.task.is_finished())
            .ok_or_else(|| RemoteError::NotFound(format!("{} turn {}", self.kind, turn.turn_id)))?;
        if !finished {
            return Ok(Vec::new());
        }

        let (_, finished_turn) = self
            .turns
            .remove(&turn.turn_id)
            .ok_or_else(|| RemoteError::NotFound(format!("{} turn {}", self.kind, turn.turn_id)))?;

        let event = match self.collect(finished_turn).await {
            Ok(parsed) => BackendEvent::TurnFinished {
                id: turn.turn_id.clone(),
                text: parsed.text,
                session_id: parsed.session_id.or_else(|| turn.session_id.clone()),
            },
            Err(e) => {
                let reason = match e {
                    RemoteError::BackendCrash { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::warn!(backend = %self.kind, turn_id = %turn.turn_id, reason = %reason, "Agent process failed");
                BackendEvent::Failed {
                    id: turn.turn_id.clone(),
                    reason,
                }
            }
        };
        Ok(vec![event])
    }

    async fn interrupt(&self, turn: &TurnHandle) -> Result<()> {
        if let Some((_, running)) = self.turns.remove(&turn.turn_id) {
            // dropping the wait future drops the child, which kills it
            running.task.abort();
            tracing::info!(backend = %self.kind, turn_id = %turn.turn_id, "Agent process killed");
        }
        Ok(())
    }

    fn release(&self, turn: &TurnHandle) {
        if let Some((_, running)) = self.turns.remove(&turn.turn_id) {
            running.task.abort();
        }
    }

    async fn shutdown(&self) {
        let ids: Vec<String> = self.turns.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, running)) = self.turns.remove(&id) {
                running.task.abort();
            }
        }
    }
}
