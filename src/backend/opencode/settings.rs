//! Read-only view of the user's opencode.json
//!
//! Supplies the default agent, per-agent models and reasoning effort, and
//! the agents usable as subagent prefixes.

use crate::routing::SubagentDef;
use serde_json::{Map, Value};
use std::path::Path;

/// Reasoning levels OpenCode accepts, lowest first
pub const REASONING_EFFORTS: [&str; 7] = ["none", "minimal", "low", "medium", "high", "xhigh", "max"];

/// Lowercased effort if valid, `None` (with a warning) otherwise.
pub fn normalize_reasoning_effort(value: &str) -> Option<String> {
    let effort = value.trim().to_lowercase();
    if effort.is_empty() {
        return None;
    }
    if REASONING_EFFORTS.contains(&effort.as_str()) {
        Some(effort)
    } else {
        tracing::warn!(effort = %value, "Ignoring unknown reasoning effort");
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpenCodeSettings {
    root: Map<String, Value>,
}

impl OpenCodeSettings {
    /// Load opencode.json. Missing or malformed files yield empty settings.
    pub fn load(path: &Path) -> Self {
        Self::from_read(path, std::fs::read_to_string(path))
    }

    /// [`load`](Self::load) without blocking the executor.
    pub async fn load_async(path: &Path) -> Self {
        Self::from_read(path, tokio::fs::read_to_string(path).await)
    }

    fn from_read(path: &Path, read: std::io::Result<String>) -> Self {
        let content = match read {
            Ok(content) => content,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to read opencode.json");
                }
                return Self::default();
            }
        };
        match serde_json::from_str::<Value>(&content) {
            Ok(value) => Self::from_value(value),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to parse opencode.json");
                Self::default()
            }
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(root) => Self { root },
            _ => {
                tracing::warn!("opencode.json root is not an object");
                Self::default()
            }
        }
    }

    fn agents(&self) -> Option<&Map<String, Value>> {
        self.root.get("agent").and_then(Value::as_object)
    }

    fn agent(&self, name: &str) -> Option<&Map<String, Value>> {
        let agents = self.agents()?;
        agents
            .get(name)
            .or_else(|| {
                let wanted = name.trim().to_lowercase();
                agents
                    .iter()
                    .find(|(k, _)| k.to_lowercase() == wanted)
                    .map(|(_, v)| v)
            })
            .and_then(Value::as_object)
    }

    fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
        map.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn agent_model(&self, agent: &str) -> Option<String> {
        self.agent(agent).and_then(|a| Self::string_field(a, "model"))
    }

    pub fn agent_reasoning_effort(&self, agent: &str) -> Option<String> {
        self.agent(agent)
            .and_then(|a| Self::string_field(a, "reasoningEffort"))
            .and_then(|e| normalize_reasoning_effort(&e))
    }

    pub fn global_model(&self) -> Option<String> {
        Self::string_field(&self.root, "model")
    }

    pub fn global_reasoning_effort(&self) -> Option<String> {
        Self::string_field(&self.root, "reasoningEffort").and_then(|e| normalize_reasoning_effort(&e))
    }

    pub fn default_agent(&self) -> Option<String> {
        Self::string_field(&self.root, "default_agent")
    }

    /// Model for `agent`, falling back to the top-level model
    pub fn model_for(&self, agent: &str) -> Option<String> {
        self.agent_model(agent).or_else(|| self.global_model())
    }

    pub fn reasoning_effort_for(&self, agent: &str) -> Option<String> {
        self.agent_reasoning_effort(agent)
            .or_else(|| self.global_reasoning_effort())
    }

    /// Named agent entries that are not disabled
    pub fn subagents(&self) -> Vec<SubagentDef> {
        let Some(agents) = self.agents() else {
            return Vec::new();
        };
        let mut defs: Vec<SubagentDef> = agents
            .iter()
            .filter_map(|(name, value)| {
                let entry = value.as_object()?;
                if entry.get("disable").and_then(Value::as_bool) == Some(true) {
                    return None;
                }
                Some(SubagentDef {
                    name: name.clone(),
                    model: Self::string_field(entry, "model"),
                    reasoning_effort: Self::string_field(entry, "reasoningEffort")
                        .and_then(|e| normalize_reasoning_effort(&e)),
                    description: Self::string_field(entry, "description"),
                })
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}
