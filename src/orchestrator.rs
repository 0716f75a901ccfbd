//! Orchestrator
//!
//! Entry point for inbound chat events. Routes each message, resolves its
//! session, and runs at most one poll loop per base session key. Answers to
//! pending questions, `/stop` and `/reset` bypass the loop and act on it
//! directly.

use crate::backend::{BackendKind, BackendSet};
use crate::config::RemoteConfig;
use crate::coordinator::{IgnoreReason, QuestionCoordinator, SubmitOutcome};
use crate::error::{RemoteError, Result};
use crate::events::{AgentEvent, EventSink, OutboundEvent};
use crate::identity::{AnswerChoice, AnswerSelection, ConversationIdentity, InboundEvent};
use crate::poll_loop::{LoopState, PollContext, PollLoopEngine};
use crate::routing::{AgentRouter, DiscoveredCatalog, RoutingDecision, SubagentCatalog};
use crate::session::{FileSessionStore, SessionRegistry};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STOP_COMMAND: &str = "/stop";
const RESET_COMMANDS: [&str; 2] = ["/reset", "/clear"];

/// What [`Orchestrator::handle`] did with an inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// A new poll loop was started
    Started(BackendKind),
    Answered,
    AnswerIgnored,
    /// The backend rejected the answer; the waiting loop reports the error
    AnswerFailed,
    /// Another loop is already running for this conversation
    Busy,
    Stopped,
    NothingToStop,
    /// Conversation reset; number of sessions dropped
    Reset(usize),
    RoutingFailed,
    Empty,
}

struct ActiveTask {
    task_id: u64,
    cancel: CancellationToken,
    handle: Option<JoinHandle<LoopState>>,
}

struct Inner {
    config: Arc<RemoteConfig>,
    router: Arc<AgentRouter>,
    registry: Arc<SessionRegistry>,
    backends: BackendSet,
    coordinator: Arc<QuestionCoordinator>,
    engine: PollLoopEngine,
    sink: Arc<dyn EventSink>,
    active: DashMap<String, ActiveTask>,
    next_task: AtomicU64,
}

/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: RemoteConfig,
        backends: BackendSet,
        registry: Arc<SessionRegistry>,
        catalog: Arc<dyn SubagentCatalog>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let config = Arc::new(config);
        let coordinator = Arc::new(QuestionCoordinator::new(config.poll.question_timeout()));
        let engine = PollLoopEngine::new(
            coordinator.clone(),
            registry.clone(),
            sink.clone(),
            config.poll.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                router: Arc::new(AgentRouter::new(config.clone(), catalog)),
                config,
                registry,
                backends,
                coordinator,
                engine,
                sink,
                active: DashMap::new(),
                next_task: AtomicU64::new(1),
            }),
        }
    }

    /// Wire up file-backed sessions, enabled backends, and on-disk subagents.
    pub fn from_config(config: RemoteConfig, sink: Arc<dyn EventSink>) -> Result<Self> {
        config.validate()?;
        let backends = BackendSet::from_config(&config)?;
        let store = Arc::new(FileSessionStore::new(config.sessions_dir()));
        let registry = Arc::new(SessionRegistry::new(store));
        let catalog = Arc::new(DiscoveredCatalog::from_config(&config));
        Ok(Self::new(config, backends, registry, catalog, sink))
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn coordinator(&self) -> &Arc<QuestionCoordinator> {
        &self.inner.coordinator
    }

    /// Load persisted sessions. Returns how many were restored.
    pub async fn start(&self) -> Result<usize> {
        let restored = self.inner.registry.preload().await?;
        // TODO: re-attach questions that were pending before a restart; they are lost today
        tracing::info!(
            sessions = restored,
            backends = ?self.inner.backends.kinds(),
            "Orchestrator started"
        );
        Ok(restored)
    }

    pub async fn handle(&self, event: InboundEvent) -> Dispatch {
        let InboundEvent {
            identity,
            text,
            answer,
        } = event;

        if let Some(selection) = answer {
            return self.answer(&identity, selection).await;
        }

        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case(STOP_COMMAND) {
            return self.stop(&identity).await;
        }
        if RESET_COMMANDS.iter().any(|c| trimmed.eq_ignore_ascii_case(c)) {
            return self.reset(&identity).await;
        }
        if trimmed.is_empty() {
            return Dispatch::Empty;
        }

        let key = identity.base_session_key();
        if let Some(pending) = self.inner.coordinator.pending(&key) {
            let selection = AnswerSelection {
                correlation_id: pending.call_id,
                choice: AnswerChoice::Text(trimmed.to_string()),
            };
            return self.answer(&identity, selection).await;
        }

        let decision = match self.route(&identity, trimmed).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(session_key = %key, error = %e, "Routing failed");
                self.emit(&identity, AgentEvent::error(&e)).await;
                return Dispatch::RoutingFailed;
            }
        };

        self.spawn(identity, decision).await
    }

    /// Subagent discovery reads the disk, so routing runs on the blocking pool.
    async fn route(&self, identity: &ConversationIdentity, text: &str) -> Result<RoutingDecision> {
        let router = self.inner.router.clone();
        let channel = self.inner.config.channel_for(identity).cloned();
        let who = identity.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || router.route(&who, &text, channel.as_ref()))
            .await
            .unwrap_or_else(|e| Err(RemoteError::Routing(format!("routing task failed: {}", e))))
    }

    async fn spawn(&self, identity: ConversationIdentity, decision: RoutingDecision) -> Dispatch {
        let key = identity.base_session_key();
        let task_id = self.inner.next_task.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let claimed = match self.inner.active.entry(key.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ActiveTask {
                    task_id,
                    cancel: cancel.clone(),
                    handle: None,
                });
                true
            }
        };
        if !claimed {
            tracing::info!(session_key = %key, "Rejecting message while a task is running");
            let busy = RemoteError::Busy(key);
            self.emit(&identity, AgentEvent::notice(busy.to_string())).await;
            return Dispatch::Busy;
        }

        if decision.acknowledged {
            let subagent = decision.options.subagent.clone().unwrap_or_default();
            self.emit(&identity, AgentEvent::Acknowledged { subagent })
                .await;
        }

        let backend = decision.backend;
        let inner = self.inner.clone();
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let state = run_turn(&inner, identity, decision, cancel).await;
            inner
                .active
                .remove_if(&task_key, |_, task| task.task_id == task_id);
            state
        });

        if let Some(mut task) = self.inner.active.get_mut(&key) {
            if task.task_id == task_id {
                task.handle = Some(handle);
            }
        }
        Dispatch::Started(backend)
    }

    /// Deliver an answer selection to the pending question.
    pub async fn answer(
        &self,
        identity: &ConversationIdentity,
        selection: AnswerSelection,
    ) -> Dispatch {
        let key = identity.base_session_key();
        let coordinator = &self.inner.coordinator;

        let Some(pending) = coordinator
            .pending(&key)
            .filter(|p| p.call_id == selection.correlation_id)
        else {
            let text = if coordinator.is_timed_out(&key, &selection.correlation_id) {
                "This question has expired."
            } else {
                "This question is no longer waiting for an answer."
            };
            self.emit(identity, AgentEvent::notice(text)).await;
            return Dispatch::AnswerIgnored;
        };

        let Some(answer) = pending.resolve_choice(&selection.choice) else {
            self.emit(identity, AgentEvent::notice("Invalid selection."))
                .await;
            return Dispatch::AnswerIgnored;
        };

        match coordinator
            .submit_answer(&key, &selection.correlation_id, &answer)
            .await
        {
            Ok(SubmitOutcome::Delivered) => Dispatch::Answered,
            Ok(SubmitOutcome::Ignored(reason)) => {
                if reason == IgnoreReason::TimedOut {
                    self.emit(identity, AgentEvent::notice("This question has expired."))
                        .await;
                }
                Dispatch::AnswerIgnored
            }
            Err(e) => {
                tracing::warn!(session_key = %key, error = %e, "Answer not delivered");
                Dispatch::AnswerFailed
            }
        }
    }

    /// Cancel the running loop for a conversation.
    pub async fn stop(&self, identity: &ConversationIdentity) -> Dispatch {
        let key = identity.base_session_key();
        let cancelled = self
            .inner
            .active
            .get(&key)
            .map(|task| task.cancel.cancel())
            .is_some();

        if cancelled {
            tracing::info!(session_key = %key, "Stop requested");
            Dispatch::Stopped
        } else {
            self.emit(identity, AgentEvent::notice("No task is running."))
                .await;
            Dispatch::NothingToStop
        }
    }

    /// Stop any running loop and forget the conversation's sessions.
    pub async fn reset(&self, identity: &ConversationIdentity) -> Dispatch {
        let key = identity.base_session_key();
        let handle = self.inner.active.get_mut(&key).and_then(|mut task| {
            task.cancel.cancel();
            task.handle.take()
        });
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.coordinator.forget(&key);

        match self.inner.registry.reset(&key).await {
            Ok(removed) => {
                tracing::info!(session_key = %key, removed, "Conversation reset");
                self.emit(identity, AgentEvent::notice("Session reset. The next message starts fresh."))
                    .await;
                Dispatch::Reset(removed)
            }
            Err(e) => {
                self.emit(identity, AgentEvent::error(&e)).await;
                Dispatch::Reset(0)
            }
        }
    }

    pub fn is_active(&self, identity: &ConversationIdentity) -> bool {
        self.inner.active.contains_key(&identity.base_session_key())
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Cancel every loop, wait for them, then stop backend processes.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self
            .inner
            .active
            .iter_mut()
            .filter_map(|mut task| {
                task.cancel.cancel();
                task.handle.take()
            })
            .collect();
        let count = handles.len();
        futures::future::join_all(handles).await;

        for kind in self.inner.backends.kinds() {
            if let Ok(backend) = self.inner.backends.get(kind) {
                backend.shutdown().await;
            }
        }
        tracing::info!(cancelled = count, "Orchestrator shut down");
    }

    async fn emit(&self, identity: &ConversationIdentity, event: AgentEvent) {
        self.inner
            .sink
            .emit(OutboundEvent {
                identity: identity.clone(),
                event,
            })
            .await;
    }
}

/// Start the backend turn and drive it. Failures before the loop starts
/// still produce exactly one outcome event.
async fn run_turn(
    inner: &Inner,
    identity: ConversationIdentity,
    decision: RoutingDecision,
    cancel: CancellationToken,
) -> LoopState {
    let key = identity.base_session_key();

    let backend = match inner.backends.get(decision.backend) {
        Ok(backend) => backend,
        Err(e) => return report_failure(inner, identity, e).await,
    };
    let session = match inner
        .registry
        .resolve(&identity, &decision.working_dir, decision.backend)
        .await
    {
        Ok(session) => session,
        Err(e) => return report_failure(inner, identity, e).await,
    };

    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        result = backend.start_or_continue(&session, &decision.message, &decision.options) => Some(result),
    };
    let turn = match started {
        None => {
            inner
                .sink
                .emit(OutboundEvent {
                    identity,
                    event: AgentEvent::Cancelled {
                        text: crate::poll_loop::CANCELLED_TEXT.to_string(),
                    },
                })
                .await;
            return LoopState::Cancelled;
        }
        Some(Ok(turn)) => turn,
        Some(Err(e)) => return report_failure(inner, identity, e).await,
    };

    tracing::info!(
        session_key = %key,
        backend = %turn.backend,
        turn_id = %turn.turn_id,
        "Turn started"
    );

    inner
        .engine
        .run(PollContext {
            identity,
            session,
            backend,
            turn,
            cancel,
        })
        .await
}

async fn report_failure(inner: &Inner, identity: ConversationIdentity, err: RemoteError) -> LoopState {
    tracing::error!(
        session_key = %identity.base_session_key(),
        error = %err,
        "Turn failed to start"
    );
    inner
        .sink
        .emit(OutboundEvent {
            identity,
            event: AgentEvent::error(&err),
        })
        .await;
    LoopState::Failed
}
