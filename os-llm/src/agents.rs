//! Per-sender model routing loaded from `agents.json`.
//!
//! ```json
//! {
//!   "routing": { "bindings": [ { "from": ["OWNER_ID", "12345"], "to": "agent-admin" } ] },
//!   "agents": { "defaults": { "model": {
//!     "agent-admin": { "primary": "openrouter/anthropic/claude-3-haiku", "fallbacks": [] }
//!   } } }
//! }
//! ```
//!
//! Binding entries spelled like environment variable names are looked up in
//! the environment when a sender is resolved. Model ids lose their
//! `openrouter/` prefix.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const OPENROUTER_PREFIX: &str = "openrouter/";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AgentsFile {
    routing: RoutingSection,
    agents: AgentsSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RoutingSection {
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Binding {
    #[serde(default)]
    from: Vec<String>,
    to: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AgentsSection {
    defaults: AgentDefaults,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct AgentDefaults {
    model: HashMap<String, RawModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawModelConfig {
    primary: String,
    #[serde(default)]
    fallbacks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentModelConfig {
    pub primary: String,
    pub fallbacks: Vec<String>,
}

impl AgentModelConfig {
    /// Primary first, then fallbacks, without duplicates or blanks.
    pub fn candidates(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(1 + self.fallbacks.len());
        for model in std::iter::once(&self.primary).chain(self.fallbacks.iter()) {
            if model.is_empty() || out.iter().any(|m| m == model) {
                continue;
            }
            out.push(model.clone());
        }
        out
    }
}

/// Binding table shared by the router. Reloadable in place.
#[derive(Debug)]
pub struct AgentBindings {
    path: Option<PathBuf>,
    file: RwLock<AgentsFile>,
}

impl AgentBindings {
    pub fn empty() -> Self {
        Self {
            path: None,
            file: RwLock::new(AgentsFile::default()),
        }
    }

    /// Missing or malformed files degrade to an empty table.
    pub fn load(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
            file: RwLock::new(read_agents_file(path)),
        }
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let file: AgentsFile = serde_json::from_str(raw)
            .map_err(|e| crate::LlmError::AgentConfig(format!("parse agents json: {e}")))?;
        Ok(Self {
            path: None,
            file: RwLock::new(file),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file. Returns the number of bindings now loaded.
    pub fn reload(&self) -> usize {
        let Some(path) = self.path.as_deref() else {
            return self.binding_count();
        };
        let fresh = read_agents_file(path);
        let count = fresh.routing.bindings.len();
        *self
            .file
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        tracing::info!(path = %path.display(), bindings = count, "agents config reloaded");
        count
    }

    pub fn binding_count(&self) -> usize {
        self.file
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .routing
            .bindings
            .len()
    }

    pub fn resolve_agent(&self, sender_id: &str) -> Option<String> {
        self.resolve_agent_with(sender_id, |name| std::env::var(name).ok())
    }

    /// First binding whose (expanded) `from` list contains the sender.
    pub fn resolve_agent_with<F>(&self, sender_id: &str, env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = self
            .file
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.routing
            .bindings
            .iter()
            .find(|binding| {
                binding.from.iter().any(|raw| {
                    if looks_like_env_name(raw) {
                        env(raw).as_deref().unwrap_or(raw.as_str()) == sender_id
                    } else {
                        raw == sender_id
                    }
                })
            })
            .map(|binding| binding.to.clone())
    }

    pub fn model_config(&self, agent: &str) -> Option<AgentModelConfig> {
        let file = self
            .file
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        file.agents
            .defaults
            .model
            .get(agent)
            .map(|raw| AgentModelConfig {
                primary: strip_provider_prefix(&raw.primary),
                fallbacks: raw
                    .fallbacks
                    .iter()
                    .map(|m| strip_provider_prefix(m))
                    .collect(),
            })
    }

    /// Ordered candidate models for a sender, with the agent name.
    pub fn models_for(&self, sender_id: &str) -> Option<(String, Vec<String>)> {
        let agent = self.resolve_agent(sender_id)?;
        let models = self.model_config(&agent)?.candidates();
        if models.is_empty() {
            return None;
        }
        Some((agent, models))
    }
}

fn read_agents_file(path: &Path) -> AgentsFile {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "agents config not found; agent routing disabled");
            return AgentsFile::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "agents config unreadable; agent routing disabled");
            return AgentsFile::default();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!(path = %path.display(), %e, "agents config invalid; agent routing disabled");
            AgentsFile::default()
        }
    }
}

fn looks_like_env_name(value: &str) -> bool {
    value.chars().any(|c| c.is_ascii_uppercase())
        && value.chars().all(|c| c.is_ascii_uppercase() || c == '_')
}

fn strip_provider_prefix(model: &str) -> String {
    model
        .trim()
        .strip_prefix(OPENROUTER_PREFIX)
        .unwrap_or(model.trim())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "routing": {
            "bindings": [
                { "from": ["OWNER_TELEGRAM_ID", "555"], "to": "agent-admin" },
                { "from": ["777"], "to": "agent-guest" }
            ]
        },
        "agents": { "defaults": { "model": {
            "agent-admin": {
                "primary": "openrouter/anthropic/claude-3-haiku",
                "fallbacks": ["openrouter/google/gemma-3-27b-it:free", "anthropic/claude-3-haiku"]
            }
        } } }
    }"#;

    #[test]
    fn env_style_bindings_expand_through_lookup() {
        let bindings = AgentBindings::from_json(SAMPLE).expect("parse");
        let env = |name: &str| (name == "OWNER_TELEGRAM_ID").then(|| "42".to_string());

        assert_eq!(
            bindings.resolve_agent_with("42", env).as_deref(),
            Some("agent-admin")
        );
        assert_eq!(
            bindings.resolve_agent_with("555", env).as_deref(),
            Some("agent-admin")
        );
        assert_eq!(
            bindings.resolve_agent_with("777", env).as_deref(),
            Some("agent-guest")
        );
        assert_eq!(bindings.resolve_agent_with("nobody", env), None);
    }

    #[test]
    fn unresolved_env_binding_matches_only_its_literal_name() {
        let bindings = AgentBindings::from_json(SAMPLE).expect("parse");
        assert_eq!(
            bindings
                .resolve_agent_with("OWNER_TELEGRAM_ID", |_| None)
                .as_deref(),
            Some("agent-admin")
        );
    }

    #[test]
    fn model_config_strips_prefix_and_dedupes_candidates() {
        let bindings = AgentBindings::from_json(SAMPLE).expect("parse");
        let cfg = bindings.model_config("agent-admin").expect("agent exists");
        assert_eq!(cfg.primary, "anthropic/claude-3-haiku");
        assert_eq!(
            cfg.candidates(),
            vec![
                "anthropic/claude-3-haiku".to_string(),
                "google/gemma-3-27b-it:free".to_string(),
            ]
        );
        assert!(bindings.model_config("agent-guest").is_none());
    }

    #[test]
    fn missing_file_yields_empty_table() {
        let path = std::env::temp_dir().join("openclaw-agents-does-not-exist.json");
        let bindings = AgentBindings::load(&path);
        assert_eq!(bindings.binding_count(), 0);
        assert_eq!(bindings.resolve_agent_with("555", |_| None), None);
    }

    #[test]
    fn reload_picks_up_file_changes() {
        let path = std::env::temp_dir().join(format!(
            "openclaw-agents-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "not json").expect("write");
        let bindings = AgentBindings::load(&path);
        assert_eq!(bindings.binding_count(), 0);

        std::fs::write(&path, SAMPLE).expect("write");
        assert_eq!(bindings.reload(), 2);
        assert_eq!(
            bindings.resolve_agent_with("777", |_| None).as_deref(),
            Some("agent-guest")
        );
        let _ = std::fs::remove_file(path);
    }
}
