//! OpenCode backend
//!
//! Talks to a local `opencode serve` process. A turn is `prompt_async`
//! followed by repeated message listings; anything already present before
//! the prompt (the baseline) is ignored. The `question` tool pauses the
//! turn until it is answered through `/question/{id}/reply`.

pub mod client;
pub mod server;
pub mod settings;
pub mod types;

use super::{
    AgentBackend, BackendEvent, BackendKind, BackendQuestion, PromptOptions, QuestionOption,
    TurnHandle,
};
use crate::config::RemoteConfig;
use crate::error::{RemoteError, Result};
use crate::session::Session;
use async_trait::async_trait;
use client::OpenCodeClient;
use dashmap::DashMap;
use server::OpenCodeServer;
use settings::{normalize_reasoning_effort, OpenCodeSettings};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use types::{MessageEnvelope, ModelRef, PromptBody, QuestionRequest, QuestionToolInput};

/// Final text when the assistant finished without saying anything.
pub const EMPTY_RESPONSE: &str = "(No response from OpenCode)";

/// Backoff while the question listing catches up with the message stream.
const QUESTION_LOOKUP_DELAYS: [Duration; 4] = [
    Duration::from_millis(250),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

#[derive(Debug, Clone)]
struct QuestionRef {
    message_id: String,
    count: usize,
}

struct TurnState {
    session_id: String,
    directory: PathBuf,
    baseline: Arc<HashSet<String>>,
    questions: HashMap<String, QuestionRef>,
}

pub struct OpenCodeBackend {
    server: Arc<OpenCodeServer>,
    settings_path: PathBuf,
    default_agent: String,
    turns: DashMap<String, TurnState>,
}

impl OpenCodeBackend {
    pub fn new(server: Arc<OpenCodeServer>, settings_path: PathBuf, default_agent: String) -> Self {
        Self {
            server,
            settings_path,
            default_agent,
            turns: DashMap::new(),
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let server = OpenCodeServer::new(config.opencode.clone(), config.opencode_pid_file())?;
        Ok(Self::new(
            Arc::new(server),
            config.opencode.settings_path(),
            config.opencode.default_agent.clone(),
        ))
    }

    pub fn server(&self) -> &Arc<OpenCodeServer> {
        &self.server
    }

    fn client(&self) -> &OpenCodeClient {
        self.server.client()
    }

    fn turn_context(&self, turn: &TurnHandle) -> Result<(String, PathBuf, Arc<HashSet<String>>)> {
        let state = self
            .turns
            .get(&turn.turn_id)
            .ok_or_else(|| RemoteError::NotFound(format!("OpenCode turn {}", turn.turn_id)))?;
        Ok((
            state.session_id.clone(),
            state.directory.clone(),
            state.baseline.clone(),
        ))
    }

    async fn question_listing(&self, directory: &std::path::Path) -> Result<Vec<QuestionRequest>> {
        let mut last_err = None;
        for delay in std::iter::once(Duration::ZERO).chain(QUESTION_LOOKUP_DELAYS) {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let scoped = self.client().list_questions(Some(directory)).await;
            let listing = match scoped {
                Ok(items) if !items.is_empty() => return Ok(items),
                Ok(_) => self.client().list_questions(None).await,
                Err(e) => Err(e),
            };
            match listing {
                Ok(items) if !items.is_empty() => return Ok(items),
                Ok(_) => last_err = None,
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(Vec::new()),
        }
    }
}

/// Agent, model, and effort for a prompt: explicit options, then opencode.json,
/// then the configured default agent.
pub fn build_prompt(
    prompt: &str,
    options: &PromptOptions,
    settings: &OpenCodeSettings,
    default_agent: &str,
) -> PromptBody {
    let agent = options
        .subagent
        .clone()
        .or_else(|| settings.default_agent())
        .unwrap_or_else(|| default_agent.to_string());

    let model_key = options.model.clone().or_else(|| settings.model_for(&agent));
    let model = model_key.as_deref().and_then(|key| {
        let parsed = ModelRef::parse(key);
        if parsed.is_none() {
            tracing::warn!(model = %key, "Ignoring model without provider prefix");
        }
        parsed
    });

    let reasoning_effort = options
        .reasoning_effort
        .as_deref()
        .and_then(normalize_reasoning_effort)
        .or_else(|| settings.reasoning_effort_for(&agent));

    let mut body = PromptBody::text(prompt);
    body.agent = Some(agent);
    body.model = model;
    body.reasoning_effort = reasoning_effort;
    body
}

fn question_text(input: &QuestionToolInput) -> String {
    input
        .questions
        .iter()
        .map(|q| match q.header.as_deref().filter(|h| !h.trim().is_empty()) {
            Some(header) => format!("{}\n{}", header.trim(), q.question.trim()),
            None => q.question.trim().to_string(),
        })
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn tool_summary(part: &types::MessagePart) -> String {
    let Some(state) = &part.state else {
        return String::new();
    };
    if let Some(title) = state.title.as_deref().filter(|t| !t.is_empty()) {
        return title.to_string();
    }
    ["command", "filePath", "path", "pattern", "url"]
        .iter()
        .find_map(|k| state.input.get(*k).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

/// Questions seen in a listing: call id, owning message, number of sub-questions
type QuestionRefs = Vec<(String, String, usize)>;

/// Events for everything after the baseline, in listing order.
fn extract_events(
    messages: &[MessageEnvelope],
    baseline: &HashSet<String>,
    session_id: &str,
) -> (Vec<BackendEvent>, QuestionRefs) {
    let mut events = Vec::new();
    let mut questions = Vec::new();

    for message in messages {
        let info = &message.info;
        if baseline.contains(&info.id) || !info.is_assistant() {
            continue;
        }

        for part in message.parts.iter().filter(|p| p.kind == "tool") {
            let Some(call_id) = part.call_key() else {
                continue;
            };
            let tool = part.tool.clone().unwrap_or_else(|| "tool".to_string());
            let state = part.state.clone().unwrap_or_default();

            if tool == "question" {
                let input: QuestionToolInput =
                    serde_json::from_value(state.input.clone()).unwrap_or_default();
                let options = input
                    .questions
                    .first()
                    .map(|q| {
                        q.options
                            .iter()
                            .map(|o| QuestionOption {
                                label: o.label.clone(),
                                description: o.description.clone(),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                questions.push((
                    call_id.to_string(),
                    info.id.clone(),
                    input.questions.len().max(1),
                ));
                events.push(BackendEvent::Question(BackendQuestion {
                    call_id: call_id.to_string(),
                    text: question_text(&input),
                    options,
                    completed: state.status.as_deref() == Some("completed"),
                }));
            } else {
                events.push(BackendEvent::ToolCall {
                    call_id: call_id.to_string(),
                    summary: tool_summary(part),
                    tool,
                });
            }
        }

        if info.is_completed() && info.stopped_for_tools() {
            let text = message.text();
            if !text.is_empty() {
                events.push(BackendEvent::AssistantText {
                    id: info.id.clone(),
                    text,
                });
            }
        }
    }

    if let Some(last) = messages.last() {
        let info = &last.info;
        if !baseline.contains(&info.id)
            && info.is_assistant()
            && info.is_completed()
            && !info.stopped_for_tools()
        {
            let text = last.text();
            events.push(BackendEvent::TurnFinished {
                id: info.id.clone(),
                text: if text.is_empty() {
                    EMPTY_RESPONSE.to_string()
                } else {
                    text
                },
                session_id: Some(session_id.to_string()),
            });
        }
    }

    (events, questions)
}

/// Question request id for a call, most specific match first:
///
/// 1. same session with matching call or message id
/// 2. the oldest open question of the session
/// 3. matching call id, then matching message id, in any session
/// 4. the only question listed
fn resolve_question_id(
    listing: &[QuestionRequest],
    session_id: &str,
    call_id: &str,
    message_id: Option<&str>,
) -> Option<String> {
    let call_matches = |q: &QuestionRequest| {
        q.tool
            .as_ref()
            .is_some_and(|t| t.call_id.as_deref() == Some(call_id))
    };
    let message_matches = |q: &QuestionRequest| {
        message_id.is_some()
            && q.tool
                .as_ref()
                .is_some_and(|t| t.message_id.as_deref() == message_id)
    };

    let in_session: Vec<&QuestionRequest> = listing
        .iter()
        .filter(|q| q.session_id.as_deref() == Some(session_id))
        .collect();

    if let Some(q) = in_session.iter().copied().find(|&q| call_matches(q) || message_matches(q)) {
        return Some(q.id.clone());
    }
    if let Some(q) = in_session.first() {
        return Some(q.id.clone());
    }
    if let Some(q) = listing.iter().find(|&q| call_matches(q)) {
        return Some(q.id.clone());
    }
    if let Some(q) = listing.iter().find(|&q| message_matches(q)) {
        return Some(q.id.clone());
    }
    if listing.len() == 1 {
        return Some(listing[0].id.clone());
    }
    None
}

#[async_trait]
impl AgentBackend for OpenCodeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::OpenCode
    }

    async fn start_or_continue(
        &self,
        session: &Session,
        prompt: &str,
        options: &PromptOptions,
    ) -> Result<TurnHandle> {
        self.server.ensure_running().await?;
        let directory = session.working_dir.clone();

        let existing = match session.backend_session_for(BackendKind::OpenCode) {
            Some(id) => self
                .client()
                .get_session(&directory, id)
                .await?
                .map(|info| info.id),
            None => None,
        };
        let session_id = match existing {
            Some(id) => id,
            None => {
                let title = format!("remote: {}", session.base_key);
                self.client().create_session(&directory, &title).await?
            }
        };

        let baseline: HashSet<String> = self
            .client()
            .list_messages(&directory, &session_id)
            .await?
            .into_iter()
            .map(|m| m.info.id)
            .collect();

        let settings = OpenCodeSettings::load_async(&self.settings_path).await;
        let body = build_prompt(prompt, options, &settings, &self.default_agent);
        tracing::info!(
            session_id = %session_id,
            agent = ?body.agent,
            model = ?body.model.as_ref().map(|m| format!("{}/{}", m.provider_id, m.model_id)),
            reasoning_effort = ?body.reasoning_effort,
            baseline = baseline.len(),
            "Sending prompt to OpenCode"
        );
        self.client()
            .prompt_async(&directory, &session_id, &body)
            .await?;

        let handle = TurnHandle::new(BackendKind::OpenCode, Some(session_id.clone()), directory.clone());
        self.turns.insert(
            handle.turn_id.clone(),
            TurnState {
                session_id,
                directory,
                baseline: Arc::new(baseline),
                questions: HashMap::new(),
            },
        );
        Ok(handle)
    }

    async fn poll_incremental(&self, turn: &TurnHandle) -> Result<Vec<BackendEvent>> {
        let (session_id, directory, baseline) = self.turn_context(turn)?;
        let messages = self.client().list_messages(&directory, &session_id).await?;
        let (events, questions) = extract_events(&messages, &baseline, &session_id);

        if !questions.is_empty() {
            if let Some(mut state) = self.turns.get_mut(&turn.turn_id) {
                for (call_id, message_id, count) in questions {
                    state
                        .questions
                        .insert(call_id, QuestionRef { message_id, count });
                }
            }
        }
        Ok(events)
    }

    async fn submit_answer(&self, turn: &TurnHandle, call_id: &str, answer: &str) -> Result<()> {
        let (session_id, directory, _) = self.turn_context(turn)?;
        let question = self
            .turns
            .get(&turn.turn_id)
            .and_then(|s| s.questions.get(call_id).cloned());
        let (message_id, count) = match &question {
            Some(q) => (Some(q.message_id.as_str()), q.count),
            None => (None, 1),
        };

        let listing = self.question_listing(&directory).await?;
        let question_id = resolve_question_id(&listing, &session_id, call_id, message_id)
            .ok_or_else(|| RemoteError::SubmissionFailure {
                call_id: call_id.to_string(),
                reason: "no matching pending question on the OpenCode server".to_string(),
            })?;

        let answers = vec![vec![answer.to_string()]; count];
        self.client()
            .reply_question(&directory, &question_id, answers)
            .await?;
        tracing::info!(session_id = %session_id, call_id, question_id = %question_id, "Question answered");
        Ok(())
    }

    async fn interrupt(&self, turn: &TurnHandle) -> Result<()> {
        let (session_id, directory, _) = self.turn_context(turn)?;
        self.client().abort(&directory, &session_id).await?;
        tracing::info!(session_id = %session_id, "OpenCode turn aborted");
        Ok(())
    }

    fn release(&self, turn: &TurnHandle) {
        self.turns.remove(&turn.turn_id);
    }

    async fn shutdown(&self) {
        self.server.shutdown().await;
    }
}
