//! Error types for a3s-remote

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while routing, running, or answering agent turns
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No backend could be resolved for the conversation
    #[error("Routing error: {0}")]
    Routing(String),

    /// Backend executable or server is missing or not reachable
    #[error("Backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// An answer could not be delivered to the backend
    #[error("Failed to submit answer for call '{call_id}': {reason}")]
    SubmissionFailure { call_id: String, reason: String },

    /// No answer arrived before the question deadline
    #[error("Question '{0}' timed out")]
    QuestionTimeout(String),

    /// Backend process or server exited or stopped answering mid-turn
    #[error("Backend '{backend}' crashed: {reason}")]
    BackendCrash { backend: String, reason: String },

    /// A poll loop is already running for this session key
    #[error("Session '{0}' is busy")]
    Busy(String),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with something we could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Filesystem or process I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session storage failure
    #[error("Store error: {0}")]
    Store(String),

    /// Lookup miss (turn, session, question)
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Coarse classification carried on user-visible error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Routing,
    BackendUnavailable,
    Submission,
    QuestionTimeout,
    BackendCrash,
    Busy,
    Internal,
}

impl RemoteError {
    /// Taxonomy bucket for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::Routing(_) => ErrorKind::Routing,
            RemoteError::BackendUnavailable { .. } => ErrorKind::BackendUnavailable,
            RemoteError::SubmissionFailure { .. } => ErrorKind::Submission,
            RemoteError::QuestionTimeout(_) => ErrorKind::QuestionTimeout,
            RemoteError::BackendCrash { .. } => ErrorKind::BackendCrash,
            RemoteError::Busy(_) => ErrorKind::Busy,
            _ => ErrorKind::Internal,
        }
    }
}

/// Result type alias for a3s-remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = RemoteError::BackendUnavailable {
            backend: "opencode".into(),
            reason: "not installed".into(),
        };
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert_eq!(
            err.to_string(),
            "Backend 'opencode' unavailable: not installed"
        );

        assert_eq!(
            RemoteError::Config("bad".into()).kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            RemoteError::QuestionTimeout("call-1".into()).kind(),
            ErrorKind::QuestionTimeout
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::BackendCrash).unwrap();
        assert_eq!(json, "\"backend_crash\"");
    }
}
