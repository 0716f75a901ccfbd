//! Agent routing
//!
//! Decides, per inbound message, which backend runs it and with which
//! overrides. The bound backend comes from the per-conversation override,
//! then the platform default, then the global default. A `Name:` prefix is
//! then matched against that backend's subagents only; a match forces the
//! subagent and its declared model and reasoning effort.

pub mod subagent;

use crate::backend::opencode::settings::OpenCodeSettings;
use crate::backend::{BackendKind, PromptOptions};
use crate::config::{ChannelRouting, RemoteConfig};
use crate::error::{RemoteError, Result};
use crate::identity::ConversationIdentity;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub use subagent::{
    load_claude_subagent, load_claude_subagents, normalize_subagent_name, parse_subagent_prefix,
    PrefixMatch, SubagentDef,
};

/// Routing result for one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub backend: BackendKind,
    pub working_dir: PathBuf,
    pub options: PromptOptions,
    /// Message to send, with any matched subagent prefix removed
    pub message: String,
    /// A subagent prefix matched; the caller should show a "received" marker
    pub acknowledged: bool,
}

/// Source of subagents per backend
pub trait SubagentCatalog: Send + Sync {
    fn subagents(&self, backend: BackendKind, working_dir: &Path) -> Vec<SubagentDef>;

    fn find(&self, backend: BackendKind, working_dir: &Path, name: &str) -> Option<SubagentDef> {
        let wanted = normalize_subagent_name(name);
        self.subagents(backend, working_dir)
            .into_iter()
            .find(|def| normalize_subagent_name(&def.name) == wanted)
    }
}

/// Fixed subagent list
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: HashMap<BackendKind, Vec<SubagentDef>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: BackendKind, def: SubagentDef) -> Self {
        self.insert(backend, def);
        self
    }

    pub fn insert(&mut self, backend: BackendKind, def: SubagentDef) {
        self.entries.entry(backend).or_default().push(def);
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        let mut catalog = Self::new();
        let mut names: Vec<_> = config.subagent.keys().collect();
        names.sort();
        for name in names {
            let entry = &config.subagent[name];
            // validated on load
            let Ok(backend) = entry.backend.parse::<BackendKind>() else {
                continue;
            };
            catalog.insert(
                backend,
                SubagentDef {
                    name: name.clone(),
                    model: entry.model.clone(),
                    reasoning_effort: entry.reasoning_effort.clone(),
                    description: entry.description.clone(),
                },
            );
        }
        catalog
    }
}

impl SubagentCatalog for StaticCatalog {
    fn subagents(&self, backend: BackendKind, _working_dir: &Path) -> Vec<SubagentDef> {
        self.entries.get(&backend).cloned().unwrap_or_default()
    }
}

/// Configured subagents plus whatever is discovered on disk.
///
/// Claude: `<working_dir>/.claude/agents/*.md`, then `~/.claude/agents/*.md`,
/// then extra configured roots. OpenCode: `agent` entries in opencode.json.
///
/// Disk lookups are cached per backend and working directory for
/// [`DISCOVERY_TTL`], so edits to agent files show up within that window.
pub struct DiscoveredCatalog {
    configured: StaticCatalog,
    claude_roots: Vec<PathBuf>,
    codex_roots: Vec<PathBuf>,
    opencode_settings: PathBuf,
    ttl: Duration,
    cache: DashMap<(BackendKind, PathBuf), (Instant, Vec<SubagentDef>)>,
}

pub const DISCOVERY_TTL: Duration = Duration::from_secs(30);

impl DiscoveredCatalog {
    pub fn from_config(config: &RemoteConfig) -> Self {
        let mut claude_roots = Vec::new();
        if let Some(home) = dirs_next::home_dir() {
            claude_roots.push(home.join(".claude"));
        }
        claude_roots.extend(config.claude.subagent_roots.iter().cloned());

        Self {
            configured: StaticCatalog::from_config(config),
            claude_roots,
            codex_roots: config.codex.subagent_roots.clone(),
            opencode_settings: config.opencode.settings_path(),
            ttl: DISCOVERY_TTL,
            cache: DashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn discovered(&self, backend: BackendKind, working_dir: &Path) -> Vec<SubagentDef> {
        let key = (backend, working_dir.to_path_buf());
        if let Some(entry) = self.cache.get(&key) {
            let (loaded_at, defs) = entry.value();
            if loaded_at.elapsed() < self.ttl {
                return defs.clone();
            }
        }
        let defs = self.scan(backend, working_dir);
        self.cache.insert(key, (Instant::now(), defs.clone()));
        defs
    }

    fn scan(&self, backend: BackendKind, working_dir: &Path) -> Vec<SubagentDef> {
        let mut defs = Vec::new();
        match backend {
            BackendKind::Claude => {
                defs.extend(load_claude_subagents(&working_dir.join(".claude")));
                for root in &self.claude_roots {
                    defs.extend(load_claude_subagents(root));
                }
            }
            BackendKind::Codex => {
                for root in &self.codex_roots {
                    defs.extend(load_claude_subagents(root));
                }
            }
            BackendKind::OpenCode => {
                defs.extend(OpenCodeSettings::load(&self.opencode_settings).subagents());
            }
        }
        defs
    }
}

impl SubagentCatalog for DiscoveredCatalog {
    fn subagents(&self, backend: BackendKind, working_dir: &Path) -> Vec<SubagentDef> {
        let mut defs = self.configured.subagents(backend, working_dir);
        defs.extend(self.discovered(backend, working_dir));
        defs
    }
}

/// Agent router
pub struct AgentRouter {
    config: Arc<RemoteConfig>,
    catalog: Arc<dyn SubagentCatalog>,
}

impl AgentRouter {
    pub fn new(config: Arc<RemoteConfig>, catalog: Arc<dyn SubagentCatalog>) -> Self {
        Self { config, catalog }
    }

    /// Backend a conversation is bound to, ignoring any message prefix.
    pub fn bound_backend(
        &self,
        identity: &ConversationIdentity,
        channel: Option<&ChannelRouting>,
    ) -> Result<BackendKind> {
        let name = channel
            .and_then(|c| c.backend.as_deref())
            .filter(|b| !b.trim().is_empty())
            .or_else(|| {
                self.config
                    .platform_backends
                    .get(&identity.platform)
                    .map(String::as_str)
            })
            .unwrap_or(self.config.default_backend.as_str());

        let backend: BackendKind = name.parse()?;
        if !self.config.backend_enabled(backend) {
            return Err(RemoteError::Routing(format!(
                "Backend '{}' is disabled",
                backend
            )));
        }
        Ok(backend)
    }

    pub fn route(
        &self,
        identity: &ConversationIdentity,
        text: &str,
        channel: Option<&ChannelRouting>,
    ) -> Result<RoutingDecision> {
        // --- Bound backend ---
        let backend = self.bound_backend(identity, channel)?;
        let working_dir = channel
            .and_then(|c| c.working_dir.clone())
            .unwrap_or_else(|| self.config.default_working_dir());

        let mut decision = RoutingDecision {
            backend,
            working_dir,
            options: PromptOptions {
                model: channel.and_then(|c| c.model.clone()),
                subagent: channel.and_then(|c| c.subagent.clone()),
                reasoning_effort: channel.and_then(|c| c.reasoning_effort.clone()),
            },
            message: text.to_string(),
            acknowledged: false,
        };

        // --- Subagent prefix ---
        if let Some(prefix) = parse_subagent_prefix(text) {
            match self
                .catalog
                .find(backend, &decision.working_dir, &prefix.name)
            {
                Some(def) => {
                    tracing::info!(
                        session_key = %identity.base_session_key(),
                        backend = %backend,
                        subagent = %def.name,
                        "Subagent prefix matched"
                    );
                    decision.options = PromptOptions {
                        model: def.model,
                        subagent: Some(def.name),
                        reasoning_effort: def.reasoning_effort,
                    };
                    decision.message = prefix.message;
                    decision.acknowledged = true;
                }
                None => {
                    tracing::debug!(prefix = %prefix.name, backend = %backend, "No subagent for prefix");
                }
            }
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(config: RemoteConfig, catalog: StaticCatalog) -> AgentRouter {
        AgentRouter::new(Arc::new(config), Arc::new(catalog))
    }

    fn slack() -> ConversationIdentity {
        ConversationIdentity::new("slack", "C1", "U1")
    }

    #[test]
    fn test_global_default() {
        let r = router(RemoteConfig::default(), StaticCatalog::new());
        let d = r.route(&slack(), "hello", None).unwrap();
        assert_eq!(d.backend, BackendKind::OpenCode);
        assert_eq!(d.message, "hello");
        assert!(!d.acknowledged);
        assert_eq!(d.options, PromptOptions::default());
    }

    #[test]
    fn test_platform_default_then_channel_override() {
        let mut config = RemoteConfig::default();
        config
            .platform_backends
            .insert("slack".into(), "codex".into());
        let r = router(config, StaticCatalog::new());

        assert_eq!(r.route(&slack(), "x", None).unwrap().backend, BackendKind::Codex);

        let channel = ChannelRouting {
            backend: Some("claude".into()),
            working_dir: Some("/srv/app".into()),
            model: Some("opus".into()),
            ..Default::default()
        };
        let d = r.route(&slack(), "x", Some(&channel)).unwrap();
        assert_eq!(d.backend, BackendKind::Claude);
        assert_eq!(d.working_dir, PathBuf::from("/srv/app"));
        assert_eq!(d.options.model.as_deref(), Some("opus"));
    }

    #[test]
    fn test_unknown_or_disabled_backend_is_routing_error() {
        let r = router(RemoteConfig::default(), StaticCatalog::new());
        let channel = ChannelRouting {
            backend: Some("gemini".into()),
            ..Default::default()
        };
        let err = r.route(&slack(), "x", Some(&channel)).unwrap_err();
        assert!(matches!(err, RemoteError::Routing(_)));

        let mut config = RemoteConfig::default();
        config.opencode.enabled = false;
        let r = router(config, StaticCatalog::new());
        let err = r.route(&slack(), "x", None).unwrap_err();
        assert!(matches!(err, RemoteError::Routing(_)));
    }

    #[test]
    fn test_prefix_forces_subagent_and_its_defaults() {
        let catalog = StaticCatalog::new().with(
            BackendKind::OpenCode,
            SubagentDef::new("plan")
                .with_model("anthropic/claude-sonnet-4")
                .with_reasoning_effort("high"),
        );
        let channel = ChannelRouting {
            model: Some("openai/gpt-5".into()),
            reasoning_effort: Some("low".into()),
            ..Default::default()
        };
        let r = router(RemoteConfig::default(), catalog);
        let d = r.route(&slack(), "Plan: outline steps", Some(&channel)).unwrap();

        assert!(d.acknowledged);
        assert_eq!(d.message, "outline steps");
        assert_eq!(d.options.subagent.as_deref(), Some("plan"));
        assert_eq!(d.options.model.as_deref(), Some("anthropic/claude-sonnet-4"));
        assert_eq!(d.options.reasoning_effort.as_deref(), Some("high"));
    }

    #[test]
    fn test_unmatched_prefix_is_literal_text() {
        let catalog = StaticCatalog::new().with(BackendKind::OpenCode, SubagentDef::new("plan"));
        let r = router(RemoteConfig::default(), catalog);
        let d = r.route(&slack(), "Unknownthing: hi", None).unwrap();
        assert!(!d.acknowledged);
        assert_eq!(d.message, "Unknownthing: hi");
        assert_eq!(d.options.subagent, None);
    }

    #[test]
    fn test_only_bound_backend_subagents_match() {
        let catalog = StaticCatalog::new().with(BackendKind::Claude, SubagentDef::new("plan"));
        let r = router(RemoteConfig::default(), catalog);
        let d = r.route(&slack(), "plan: go", None).unwrap();
        assert_eq!(d.backend, BackendKind::OpenCode);
        assert!(!d.acknowledged);
        assert_eq!(d.message, "plan: go");
    }

    #[test]
    fn test_configured_subagents_in_catalog() {
        let config = RemoteConfig::parse(
            r#"
subagent "reviewer" {
  backend = "claude"
  model   = "opus"
}
"#,
        )
        .unwrap();
        let catalog = StaticCatalog::from_config(&config);
        let found = catalog
            .find(BackendKind::Claude, Path::new("/"), "REVIEWER")
            .unwrap();
        assert_eq!(found.model.as_deref(), Some("opus"));
        assert!(catalog.find(BackendKind::OpenCode, Path::new("/"), "reviewer").is_none());
    }

    #[test]
    fn test_discovered_catalog_reads_project_agents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let agents = tmp.path().join(".claude").join("agents");
        std::fs::create_dir_all(&agents).unwrap();
        std::fs::write(agents.join("tester.md"), "---\nname: tester\nmodel: haiku\n---\n").unwrap();

        let mut config = RemoteConfig::default();
        config.opencode.config_path = Some(tmp.path().join("missing-opencode.json"));
        let catalog = DiscoveredCatalog::from_config(&config);
        let def = catalog.find(BackendKind::Claude, tmp.path(), "Tester").unwrap();
        assert_eq!(def.model.as_deref(), Some("haiku"));
    }

    #[test]
    fn test_discovered_catalog_reuses_recent_scan() {
        let tmp = tempfile::TempDir::new().unwrap();
        let agents = tmp.path().join(".claude").join("agents");
        std::fs::create_dir_all(&agents).unwrap();
        std::fs::write(agents.join("tester.md"), "---\nname: tester\n---\n").unwrap();

        let mut config = RemoteConfig::default();
        config.opencode.config_path = Some(tmp.path().join("missing-opencode.json"));
        let catalog = DiscoveredCatalog::from_config(&config);
        assert!(catalog.find(BackendKind::Claude, tmp.path(), "tester").is_some());

        // served from cache, not the disk
        std::fs::remove_file(agents.join("tester.md")).unwrap();
        assert!(catalog.find(BackendKind::Claude, tmp.path(), "tester").is_some());

        // other working dirs are scanned separately
        let other = tempfile::TempDir::new().unwrap();
        assert!(catalog.find(BackendKind::Claude, other.path(), "tester").is_none());
    }

    #[test]
    fn test_discovered_catalog_rescans_after_ttl() {
        let tmp = tempfile::TempDir::new().unwrap();
        let agents = tmp.path().join(".claude").join("agents");
        std::fs::create_dir_all(&agents).unwrap();

        let mut config = RemoteConfig::default();
        config.opencode.config_path = Some(tmp.path().join("missing-opencode.json"));
        let catalog = DiscoveredCatalog::from_config(&config).with_ttl(Duration::ZERO);
        assert!(catalog.find(BackendKind::Claude, tmp.path(), "tester").is_none());

        std::fs::write(agents.join("tester.md"), "---\nname: tester\n---\n").unwrap();
        assert!(catalog.find(BackendKind::Claude, tmp.path(), "tester").is_some());
    }
}
