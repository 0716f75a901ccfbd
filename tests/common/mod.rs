//! Scripted in-memory backend and helpers shared by integration tests.

#![allow(dead_code)]

use a3s_remote::{
    AgentBackend, AgentEvent, BackendEvent, BackendKind, BackendQuestion, BackendSet,
    ChannelSink, OutboundEvent, PromptOptions, QuestionOption, RemoteConfig, RemoteError, Result,
    Session, SessionRegistry, StaticCatalog, SubagentCatalog, TurnHandle,
};
use a3s_remote::Orchestrator;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// What the backend reports over the life of one turn
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Visible right after the prompt is sent
    pub initial: Vec<BackendEvent>,
    /// Appended once an answer is accepted
    pub after_answer: Vec<BackendEvent>,
    /// Number of polls that fail before the script shows
    pub failing_polls: u32,
    pub reject_answers: bool,
}

#[derive(Debug, Clone)]
pub struct StartCall {
    pub prior_session: Option<String>,
    pub prompt: String,
    pub options: PromptOptions,
}

#[derive(Default)]
struct State {
    visible: Vec<BackendEvent>,
    polls: u32,
    starts: Vec<StartCall>,
    answers: Vec<(String, String)>,
    interrupts: u32,
}

pub struct ScriptedBackend {
    kind: BackendKind,
    script: Script,
    state: Mutex<State>,
}

impl ScriptedBackend {
    pub fn new(kind: BackendKind, script: Script) -> Arc<Self> {
        Arc::new(Self {
            kind,
            script,
            state: Mutex::new(State::default()),
        })
    }

    pub fn starts(&self) -> Vec<StartCall> {
        self.state.lock().unwrap().starts.clone()
    }

    pub fn answers(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().answers.clone()
    }

    pub fn interrupts(&self) -> u32 {
        self.state.lock().unwrap().interrupts
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn start_or_continue(
        &self,
        session: &Session,
        prompt: &str,
        options: &PromptOptions,
    ) -> Result<TurnHandle> {
        let prior = session.backend_session_for(self.kind).map(str::to_string);
        let mut state = self.state.lock().unwrap();
        state.starts.push(StartCall {
            prior_session: prior.clone(),
            prompt: prompt.to_string(),
            options: options.clone(),
        });
        state.visible = self.script.initial.clone();
        state.polls = 0;
        let session_id = prior.unwrap_or_else(|| "ses_1".to_string());
        Ok(TurnHandle::new(
            self.kind,
            Some(session_id),
            session.working_dir.clone(),
        ))
    }

    async fn poll_incremental(&self, _turn: &TurnHandle) -> Result<Vec<BackendEvent>> {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        if state.polls <= self.script.failing_polls {
            return Err(RemoteError::Protocol("connection refused".into()));
        }
        Ok(state.visible.clone())
    }

    async fn submit_answer(&self, _turn: &TurnHandle, call_id: &str, answer: &str) -> Result<()> {
        if self.script.reject_answers {
            return Err(RemoteError::SubmissionFailure {
                call_id: call_id.to_string(),
                reason: "question no longer exists".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.answers.push((call_id.to_string(), answer.to_string()));
        for event in state.visible.iter_mut() {
            if let BackendEvent::Question(q) = event {
                if q.call_id == call_id {
                    q.completed = true;
                }
            }
        }
        let follow_up = self.script.after_answer.clone();
        state.visible.extend(follow_up);
        Ok(())
    }

    async fn interrupt(&self, _turn: &TurnHandle) -> Result<()> {
        self.state.lock().unwrap().interrupts += 1;
        Ok(())
    }
}

// ─── Event builders ──────────────────────────────────────────────

pub fn question(call_id: &str, text: &str, options: &[&str]) -> BackendEvent {
    BackendEvent::Question(BackendQuestion {
        call_id: call_id.to_string(),
        text: text.to_string(),
        options: options.iter().map(|o| QuestionOption::new(*o)).collect(),
        completed: false,
    })
}

pub fn text(id: &str, body: &str) -> BackendEvent {
    BackendEvent::AssistantText {
        id: id.to_string(),
        text: body.to_string(),
    }
}

pub fn finished(id: &str, body: &str) -> BackendEvent {
    BackendEvent::TurnFinished {
        id: id.to_string(),
        text: body.to_string(),
        session_id: Some("ses_1".to_string()),
    }
}

// ─── Harness ─────────────────────────────────────────────────────

pub fn test_config() -> RemoteConfig {
    let mut config = RemoteConfig::default();
    config.default_working_dir = Some(PathBuf::from("/srv/repos/app"));
    config.poll.interval_ms = 10;
    config.poll.question_timeout_secs = 60;
    config.poll.max_consecutive_poll_failures = 3;
    config
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub backend: Arc<ScriptedBackend>,
    pub registry: Arc<SessionRegistry>,
    pub events: UnboundedReceiver<OutboundEvent>,
}

pub fn harness(script: Script) -> Harness {
    harness_with(test_config(), script, StaticCatalog::new(), Arc::new(SessionRegistry::in_memory()))
}

pub fn harness_with(
    config: RemoteConfig,
    script: Script,
    catalog: StaticCatalog,
    registry: Arc<SessionRegistry>,
) -> Harness {
    let backend = ScriptedBackend::new(BackendKind::OpenCode, script);
    let backends = BackendSet::new().with(backend.clone());
    let (sink, events) = ChannelSink::new();
    let catalog: Arc<dyn SubagentCatalog> = Arc::new(catalog);
    let orchestrator = Orchestrator::new(config, backends, registry.clone(), catalog, Arc::new(sink));
    Harness {
        orchestrator,
        backend,
        registry,
        events,
    }
}

/// Receive events until `stop` matches; returns all of them.
pub async fn recv_until(
    events: &mut UnboundedReceiver<OutboundEvent>,
    stop: impl Fn(&AgentEvent) -> bool,
) -> Vec<AgentEvent> {
    let mut seen = Vec::new();
    loop {
        let next = tokio::time::timeout(Duration::from_secs(3600), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        let done = stop(&next.event);
        seen.push(next.event);
        if done {
            return seen;
        }
    }
}

pub async fn recv_outcome(events: &mut UnboundedReceiver<OutboundEvent>) -> Vec<AgentEvent> {
    recv_until(events, AgentEvent::is_outcome).await
}

pub async fn recv_question(events: &mut UnboundedReceiver<OutboundEvent>) -> Vec<AgentEvent> {
    recv_until(events, |e| matches!(e, AgentEvent::Question(_))).await
}

/// Wait until no loop is active for the identity.
pub async fn settle(orchestrator: &Orchestrator, identity: &a3s_remote::ConversationIdentity) {
    for _ in 0..500 {
        if !orchestrator.is_active(identity) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("poll loop never finished");
}
