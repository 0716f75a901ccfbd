//! Poll-loop engine
//!
//! Drives one backend turn to completion:
//!
//! ```text
//! RUNNING ──question──▶ AWAITING_ANSWER ──answer──▶ RUNNING ──▶ … ──▶ DONE
//!                              │                                    ▲
//!                              ├──timeout──▶ TIMED_OUT              │
//!                              └──stop─────▶ CANCELLED     turn finished
//! ```
//!
//! Every terminal state emits exactly one outcome event.

use crate::backend::{AgentBackend, BackendEvent, TurnHandle};
use crate::config::PollConfig;
use crate::coordinator::{QuestionCoordinator, WaitOutcome};
use crate::error::RemoteError;
use crate::events::{AgentEvent, EventSink, OutboundEvent, QuestionPrompt};
use crate::identity::ConversationIdentity;
use crate::session::{Session, SessionRegistry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Outcome text for a stopped turn.
pub const CANCELLED_TEXT: &str = "Terminated execution.";
/// Outcome text for an unanswered question.
pub const TIMED_OUT_TEXT: &str = "No answer received in time; the task was stopped. Send a new message to continue.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    AwaitingAnswer,
    Done,
    TimedOut,
    Cancelled,
    /// Crash or undeliverable answer
    Failed,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoopState::Running | LoopState::AwaitingAnswer)
    }
}

/// Everything one loop run needs
pub struct PollContext {
    pub identity: ConversationIdentity,
    pub session: Session,
    pub backend: Arc<dyn AgentBackend>,
    pub turn: TurnHandle,
    pub cancel: CancellationToken,
}

pub struct PollLoopEngine {
    coordinator: Arc<QuestionCoordinator>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn EventSink>,
    config: PollConfig,
}

impl PollLoopEngine {
    pub fn new(
        coordinator: Arc<QuestionCoordinator>,
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn EventSink>,
        config: PollConfig,
    ) -> Self {
        Self {
            coordinator,
            registry,
            sink,
            config,
        }
    }

    /// Run until the turn reaches a terminal state.
    pub async fn run(&self, ctx: PollContext) -> LoopState {
        let key = ctx.identity.base_session_key();
        let mut session = ctx.session.clone();
        self.coordinator.begin_turn(&key);

        if let Some(id) = ctx.turn.session_id.clone() {
            self.bind_session(&ctx, &mut session, &id).await;
        }

        let state = self.drive(&ctx, &key, &mut session).await;
        ctx.backend.release(&ctx.turn);
        self.coordinator.clear(&key);
        tracing::info!(
            session_key = %key,
            backend = %ctx.turn.backend,
            state = ?state,
            "Poll loop finished"
        );
        state
    }

    async fn drive(&self, ctx: &PollContext, key: &str, session: &mut Session) -> LoopState {
        let mut failures: u32 = 0;
        let mut iteration: u64 = 0;

        'poll: loop {
            iteration += 1;
            let polled = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                result = ctx.backend.poll_incremental(&ctx.turn) => Some(result),
            };

            let events = match polled {
                None => return self.cancelled(ctx).await,
                Some(Ok(events)) => {
                    failures = 0;
                    events
                }
                Some(Err(e)) if is_terminal(&e) => {
                    let err = match e {
                        RemoteError::BackendCrash { .. } => e,
                        other => RemoteError::BackendCrash {
                            backend: ctx.turn.backend.to_string(),
                            reason: other.to_string(),
                        },
                    };
                    tracing::warn!(session_key = %key, error = %err, "Turn failed");
                    self.emit(ctx, AgentEvent::error(&err)).await;
                    return LoopState::Failed;
                }
                Some(Err(e)) => {
                    failures += 1;
                    tracing::warn!(
                        session_key = %key,
                        error = %e,
                        failures,
                        "Poll failed"
                    );
                    if failures >= self.config.max_consecutive_poll_failures {
                        let err = RemoteError::BackendCrash {
                            backend: ctx.turn.backend.to_string(),
                            reason: format!("stopped responding after {} failed polls: {}", failures, e),
                        };
                        self.emit(ctx, AgentEvent::error(&err)).await;
                        return LoopState::Failed;
                    }
                    if !self.idle(ctx).await {
                        return self.cancelled(ctx).await;
                    }
                    continue;
                }
            };

            if self.config.heartbeat_every > 0 && iteration % self.config.heartbeat_every as u64 == 0 {
                tracing::debug!(session_key = %key, iteration, batch = events.len(), "Poll heartbeat");
            }

            for event in events {
                match event {
                    BackendEvent::Question(question) => {
                        if question.completed {
                            self.coordinator.mark_seen(key, &question.call_id);
                            continue;
                        }
                        if !self.coordinator.mark_seen(key, &question.call_id) {
                            continue;
                        }

                        // pending before it is shown, so an immediate answer finds it
                        let waiter = self.coordinator.register(
                            key,
                            &question,
                            ctx.backend.clone(),
                            ctx.turn.clone(),
                        );
                        self.emit(
                            ctx,
                            AgentEvent::Question(QuestionPrompt {
                                correlation_id: question.call_id.clone(),
                                text: question.text.clone(),
                                options: question.options.clone(),
                            }),
                        )
                        .await;
                        tracing::debug!(session_key = %key, state = ?LoopState::AwaitingAnswer, "State change");

                        match self.coordinator.wait(waiter, &ctx.cancel).await {
                            WaitOutcome::Answered => {
                                tracing::debug!(session_key = %key, state = ?LoopState::Running, "State change");
                                // rest of this batch predates the answer
                                continue 'poll;
                            }
                            WaitOutcome::TimedOut => {
                                self.interrupt(ctx).await;
                                self.emit(
                                    ctx,
                                    AgentEvent::QuestionTimedOut {
                                        correlation_id: question.call_id.clone(),
                                        text: TIMED_OUT_TEXT.to_string(),
                                    },
                                )
                                .await;
                                return LoopState::TimedOut;
                            }
                            WaitOutcome::Cancelled => return self.cancelled(ctx).await,
                            WaitOutcome::SubmissionFailed(reason) => {
                                self.interrupt(ctx).await;
                                let err = RemoteError::SubmissionFailure {
                                    call_id: question.call_id.clone(),
                                    reason,
                                };
                                self.emit(ctx, AgentEvent::error(&err)).await;
                                return LoopState::Failed;
                            }
                        }
                    }
                    BackendEvent::AssistantText { id, text } => {
                        if self.coordinator.mark_seen(key, &id) {
                            self.emit(ctx, AgentEvent::AssistantText { id, text }).await;
                        }
                    }
                    BackendEvent::ToolCall {
                        call_id,
                        tool,
                        summary,
                    } => {
                        if self.coordinator.mark_seen(key, &call_id) {
                            self.emit(
                                ctx,
                                AgentEvent::ToolCall {
                                    call_id,
                                    tool,
                                    summary,
                                },
                            )
                            .await;
                        }
                    }
                    BackendEvent::Failed { reason, .. } => {
                        let err = RemoteError::BackendCrash {
                            backend: ctx.turn.backend.to_string(),
                            reason,
                        };
                        self.emit(ctx, AgentEvent::error(&err)).await;
                        return LoopState::Failed;
                    }
                    BackendEvent::TurnFinished {
                        text, session_id, ..
                    } => {
                        if let Some(id) = session_id {
                            self.bind_session(ctx, session, &id).await;
                        }
                        if let Err(e) = self.registry.touch(session).await {
                            tracing::warn!(session_key = %key, error = %e, "Failed to update session activity");
                        }
                        self.emit(ctx, AgentEvent::Result { text }).await;
                        return LoopState::Done;
                    }
                }
            }

            if !self.idle(ctx).await {
                return self.cancelled(ctx).await;
            }
        }
    }

    /// Sleep one poll interval; `false` if cancelled meanwhile.
    async fn idle(&self, ctx: &PollContext) -> bool {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.interval()) => true,
        }
    }

    async fn cancelled(&self, ctx: &PollContext) -> LoopState {
        self.interrupt(ctx).await;
        self.emit(
            ctx,
            AgentEvent::Cancelled {
                text: CANCELLED_TEXT.to_string(),
            },
        )
        .await;
        LoopState::Cancelled
    }

    async fn interrupt(&self, ctx: &PollContext) {
        if let Err(e) = ctx.backend.interrupt(&ctx.turn).await {
            tracing::warn!(
                backend = %ctx.turn.backend,
                error = %e,
                "Interrupt failed"
            );
        }
    }

    /// Persist a backend session id the first time we see it.
    async fn bind_session(&self, ctx: &PollContext, session: &mut Session, id: &str) {
        if session.backend_session_for(ctx.turn.backend) == Some(id) {
            return;
        }
        match self.registry.record_backend_session_id(session, id).await {
            Ok(updated) => *session = updated,
            Err(e) => {
                tracing::warn!(session_key = %session.base_key, error = %e, "Failed to record backend session id");
                session.set_backend_session(ctx.turn.backend, id);
            }
        }
        self.emit(
            ctx,
            AgentEvent::SessionStarted {
                backend: ctx.turn.backend,
                session_id: id.to_string(),
            },
        )
        .await;
    }

    async fn emit(&self, ctx: &PollContext, event: AgentEvent) {
        self.sink
            .emit(OutboundEvent {
                identity: ctx.identity.clone(),
                event,
            })
            .await;
    }
}

/// Errors no amount of re-polling can fix: the process died or the turn is gone.
fn is_terminal(err: &RemoteError) -> bool {
    matches!(
        err,
        RemoteError::BackendCrash { .. } | RemoteError::NotFound(_)
    )
}
