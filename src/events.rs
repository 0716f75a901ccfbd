//! Outbound events for the presentation layer
//!
//! Everything the engine wants shown in chat goes through an [`EventSink`]
//! as an [`OutboundEvent`], tagged with the conversation it belongs to.

use crate::backend::{BackendKind, QuestionOption};
use crate::error::{ErrorKind, RemoteError};
use crate::identity::ConversationIdentity;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// A question shown to the user. `correlation_id` must be echoed back with the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuestionPrompt {
    pub correlation_id: String,
    pub text: String,
    pub options: Vec<QuestionOption>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Subagent prefix matched; show a lightweight "received" marker
    Acknowledged { subagent: String },
    /// Backend assigned a new session id
    SessionStarted { backend: BackendKind, session_id: String },
    AssistantText { id: String, text: String },
    ToolCall { call_id: String, tool: String, summary: String },
    Question(QuestionPrompt),
    /// Informational, never terminal
    Notice { text: String },
    /// Final answer of a turn
    Result { text: String },
    QuestionTimedOut { correlation_id: String, text: String },
    Cancelled { text: String },
    Error { kind: ErrorKind, message: String },
}

impl AgentEvent {
    pub fn error(err: &RemoteError) -> Self {
        AgentEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        AgentEvent::Notice { text: text.into() }
    }

    /// Events that end a poll loop; each loop emits exactly one.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            AgentEvent::Result { .. }
                | AgentEvent::QuestionTimedOut { .. }
                | AgentEvent::Cancelled { .. }
                | AgentEvent::Error { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEvent {
    pub identity: ConversationIdentity,
    pub event: AgentEvent,
}

/// Downstream consumer of outbound events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: OutboundEvent);
}

/// Sink backed by an unbounded channel
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: OutboundEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Event receiver dropped; outbound event discarded");
        }
    }
}
