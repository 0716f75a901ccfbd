//! Wire types for the OpenCode server API

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    #[serde(default)]
    pub healthy: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionBody<'a> {
    pub title: &'a str,
}

/// `provider/model` split into the shape the prompt endpoint expects
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelRef {
    #[serde(rename = "providerID")]
    pub provider_id: String,
    #[serde(rename = "modelID")]
    pub model_id: String,
}

impl ModelRef {
    pub fn parse(key: &str) -> Option<Self> {
        let (provider, model) = key.trim().split_once('/')?;
        if provider.is_empty() || model.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider.to_string(),
            model_id: model.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextPartInput {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptBody {
    pub parts: Vec<TextPartInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelRef>,
    #[serde(rename = "reasoningEffort", skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

impl PromptBody {
    pub fn text(prompt: &str) -> Self {
        Self {
            parts: vec![TextPartInput {
                kind: "text",
                text: prompt.to_string(),
            }],
            agent: None,
            model: None,
            reasoning_effort: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub time: MessageTime,
    #[serde(default)]
    pub finish: Option<String>,
}

impl MessageInfo {
    pub fn is_assistant(&self) -> bool {
        self.role == "assistant"
    }

    pub fn is_completed(&self) -> bool {
        self.time.completed.is_some()
    }

    /// Completed, but the model stopped only to run tools
    pub fn stopped_for_tools(&self) -> bool {
        self.finish.as_deref() == Some("tool-calls")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolState {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "callID", default)]
    pub call_id: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub state: Option<ToolState>,
    #[serde(default)]
    pub text: Option<String>,
}

impl MessagePart {
    /// Stable id for a tool part: call id, then part id
    pub fn call_key(&self) -> Option<&str> {
        self.call_id
            .as_deref()
            .or(self.id.as_deref())
            .filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEnvelope {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

impl MessageEnvelope {
    /// Text parts joined by a blank line
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.as_deref())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Input of the `question` tool
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuestionToolInput {
    #[serde(default)]
    pub questions: Vec<QuestionSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuestionSpec {
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub options: Vec<QuestionOptionSpec>,
    #[serde(default)]
    pub multiple: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionOptionSpec {
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Entry of `GET /question`
#[derive(Debug, Clone, Deserialize)]
pub struct QuestionRequest {
    pub id: String,
    #[serde(rename = "sessionID", alias = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub tool: Option<QuestionToolRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestionToolRef {
    #[serde(rename = "callID", alias = "callId", default)]
    pub call_id: Option<String>,
    #[serde(rename = "messageID", alias = "messageId", default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuestionReplyBody {
    pub answers: Vec<Vec<String>>,
}
