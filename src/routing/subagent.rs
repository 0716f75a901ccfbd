//! Subagent prefixes and discovery
//!
//! A message like `Plan: outline the migration` asks for the `plan`
//! subagent. Claude subagents are markdown files with YAML frontmatter
//! under `<root>/agents/`; OpenCode subagents live in opencode.json.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Longest name accepted as a subagent prefix.
const MAX_NAME_LEN: usize = 64;

/// A subagent the bound backend can run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubagentDef {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, alias = "reasoningEffort")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl SubagentDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
            reasoning_effort: None,
            description: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_reasoning_effort(mut self, effort: impl Into<String>) -> Self {
        self.reasoning_effort = Some(effort.into());
        self
    }
}

/// `Name:` prefix split off a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixMatch {
    pub name: String,
    pub message: String,
}

/// Split `Name: body` (ASCII or full-width colon). Leading whitespace is
/// ignored; the body must be non-empty after trimming.
pub fn parse_subagent_prefix(text: &str) -> Option<PrefixMatch> {
    let text = text.trim_start();
    let (index, colon) = text.char_indices().find(|(_, c)| *c == ':' || *c == '：')?;
    let name = text[..index].trim_end();
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || !name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return None;
    }
    let message = text[index + colon.len_utf8()..].trim();
    if message.is_empty() {
        return None;
    }
    Some(PrefixMatch {
        name: name.to_string(),
        message: message.to_string(),
    })
}

pub fn normalize_subagent_name(name: &str) -> String {
    name.trim().to_lowercase()
}

#[derive(Debug, Default, Deserialize)]
struct Frontmatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, alias = "reasoningEffort")]
    reasoning_effort: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

fn parse_frontmatter(content: &str) -> Option<Frontmatter> {
    let rest = content.trim_start_matches('\u{feff}').strip_prefix("---")?;
    let end = rest.find("\n---")?;
    match serde_yaml::from_str::<Frontmatter>(&rest[..end]) {
        Ok(fm) => Some(fm),
        Err(e) => {
            tracing::debug!(error = %e, "Invalid subagent frontmatter");
            None
        }
    }
}

fn read_definition(path: &Path) -> Option<SubagentDef> {
    let content = std::fs::read_to_string(path).ok()?;
    let stem = path.file_stem()?.to_str()?.to_string();
    let fm = parse_frontmatter(&content).unwrap_or_default();
    Some(SubagentDef {
        name: fm.name.filter(|n| !n.trim().is_empty()).unwrap_or(stem),
        model: fm.model,
        reasoning_effort: fm.reasoning_effort,
        description: fm.description,
    })
}

fn agent_files(search_root: &Path) -> Vec<PathBuf> {
    let dir = search_root.join("agents");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    files.sort();
    files
}

/// Every subagent defined under `<search_root>/agents/*.md`
pub fn load_claude_subagents(search_root: &Path) -> Vec<SubagentDef> {
    agent_files(search_root)
        .iter()
        .filter_map(|p| read_definition(p))
        .collect()
}

/// Case-insensitive lookup by file name or frontmatter `name`
pub fn load_claude_subagent(name: &str, search_root: &Path) -> Option<SubagentDef> {
    let wanted = normalize_subagent_name(name);
    agent_files(search_root).into_iter().find_map(|path| {
        let stem_matches = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| normalize_subagent_name(s) == wanted)
            .unwrap_or(false);
        let def = read_definition(&path)?;
        (stem_matches || normalize_subagent_name(&def.name) == wanted).then_some(def)
    })
}
