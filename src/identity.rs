//! Conversation identity and inbound chat events
//!
//! A [`ConversationIdentity`] names one chat thread. Its base session key
//! is the primary lookup key for sessions, active poll loops, and pending
//! questions.

use serde::{Deserialize, Serialize};

/// Platform + channel + optional thread + user, as delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationIdentity {
    /// Chat platform name (e.g. `slack`, `telegram`)
    pub platform: String,
    /// Channel or chat id on that platform
    pub channel_id: String,
    /// Thread id, when the message lives inside a thread
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Sender
    pub user_id: String,
}

impl ConversationIdentity {
    pub fn new(
        platform: impl Into<String>,
        channel_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            platform: platform.into(),
            channel_id: channel_id.into(),
            thread_id: None,
            user_id: user_id.into(),
        }
    }

    /// Attach a thread id. Empty ids are treated as "no thread".
    pub fn with_thread(mut self, thread_id: impl Into<String>) -> Self {
        let thread_id = thread_id.into();
        self.thread_id = if thread_id.trim().is_empty() {
            None
        } else {
            Some(thread_id)
        };
        self
    }

    /// `{platform}_{channel}` or `{platform}_{channel}_{thread}`
    pub fn base_session_key(&self) -> String {
        match &self.thread_id {
            Some(thread) => format!("{}_{}_{}", self.platform, self.channel_id, thread),
            None => format!("{}_{}", self.platform, self.channel_id),
        }
    }
}

/// Which option the user picked when answering a question
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerChoice {
    /// 1-based index into the offered options
    Option(usize),
    /// Free-text answer
    Text(String),
}

/// Answer payload attached to a button click or modal submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerSelection {
    /// Correlation id echoed back from the question prompt
    pub correlation_id: String,
    pub choice: AnswerChoice,
}

/// An inbound chat event handed to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub identity: ConversationIdentity,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<AnswerSelection>,
}

impl InboundEvent {
    pub fn new(identity: ConversationIdentity, text: impl Into<String>) -> Self {
        Self {
            identity,
            text: text.into(),
            answer: None,
        }
    }

    /// An answer click for an outstanding question.
    pub fn answer(
        identity: ConversationIdentity,
        correlation_id: impl Into<String>,
        choice: AnswerChoice,
    ) -> Self {
        Self {
            identity,
            text: String::new(),
            answer: Some(AnswerSelection {
                correlation_id: correlation_id.into(),
                choice,
            }),
        }
    }

    pub fn is_answer(&self) -> bool {
        self.answer.is_some()
    }
}
