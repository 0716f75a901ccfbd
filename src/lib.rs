//! # a3s-remote
//!
//! Drive AI coding agents (Claude Code, Codex, OpenCode) from chat threads.
//!
//! ## Overview
//!
//! Each chat conversation maps to a base session key. Inbound messages are
//! routed to an agent backend, sent as a prompt, and then followed by a poll
//! loop that streams assistant output back to chat. When the agent asks an
//! interactive question the loop blocks until the user answers, the question
//! times out, or the user stops the task.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_remote::{ChannelSink, ConversationIdentity, InboundEvent, Orchestrator, RemoteConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_remote::Result<()> {
//! let config = RemoteConfig::from_file(std::path::Path::new("a3s-remote.hcl"))?;
//! let (sink, mut events) = ChannelSink::new();
//! let orchestrator = Orchestrator::from_config(config, Arc::new(sink))?;
//! orchestrator.start().await?;
//!
//! let who = ConversationIdentity::new("slack", "C024BE91L", "U1").with_thread("1700000000.1");
//! orchestrator.handle(InboundEvent::new(who, "fix the failing test")).await;
//!
//! while let Some(out) = events.recv().await {
//!     println!("{:?}", out.event);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **claude**: `claude -p` per turn, resumed by session id
//! - **codex**: `codex exec --json` per turn, resumed by thread id
//! - **opencode**: long-lived `opencode serve` driven over HTTP; the only
//!   backend that asks interactive questions
//!
//! ## Architecture
//!
//! - **Orchestrator**: entry point; one active poll loop per conversation
//! - **AgentRouter**: backend binding and `Name:` subagent prefixes
//! - **SessionRegistry**: persistent conversation to backend session map
//! - **PollLoopEngine**: drives a turn to exactly one outcome event
//! - **QuestionCoordinator**: pending questions, answers, and timeouts
//! - **AgentBackend** trait: what every backend implements

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod identity;
pub mod orchestrator;
pub mod poll_loop;
pub mod routing;
pub mod session;
pub mod telemetry;

// Re-export core types
pub use backend::{
    AgentBackend, BackendEvent, BackendKind, BackendQuestion, BackendSet, PromptOptions,
    QuestionOption, TurnHandle,
};
pub use config::{ChannelRouting, PollConfig, RemoteConfig};
pub use coordinator::{PendingQuestion, QuestionCoordinator, SubmitOutcome, WaitOutcome};
pub use error::{ErrorKind, RemoteError, Result};
pub use events::{AgentEvent, ChannelSink, EventSink, OutboundEvent, QuestionPrompt};
pub use identity::{AnswerChoice, AnswerSelection, ConversationIdentity, InboundEvent};
pub use orchestrator::{Dispatch, Orchestrator};
pub use poll_loop::{LoopState, PollContext, PollLoopEngine};
pub use routing::{AgentRouter, RoutingDecision, StaticCatalog, SubagentCatalog, SubagentDef};
pub use session::{FileSessionStore, MemorySessionStore, Session, SessionRegistry, SessionStore};
pub use telemetry::init_tracing;
