//! Pluggable intent handlers.
//!
//! A [`Skill`] declares its name, a one-line description (also used by the
//! LLM intent classifier), the minimum sender tier and a few example
//! phrases. The gateway picks one per message and calls
//! [`Skill::execute`].

mod conversation;
mod daily_briefing;
mod memory;
mod overseer;
mod security_monitor;
mod smart_home;
mod ssh_hardening;
mod system_admin;
mod web_search;

pub use conversation::ConversationSkill;
pub use daily_briefing::{DailyBriefingSkill, NotionDatabases};
pub use memory::MemorySkill;
pub use overseer::OverseerSkill;
pub use security_monitor::SecurityMonitorSkill;
pub use smart_home::SmartHomeSkill;
pub use ssh_hardening::SshHardeningSkill;
pub use system_admin::SystemAdminSkill;
pub use web_search::WebSearchSkill;

use crate::intent::SkillMatch;
use anyhow::Result;
use async_trait::async_trait;
use os_channels::InboundMessage;
use os_llm::ChatMessage;
use serde::Serialize;
use std::sync::Arc;

/// Registry matches must beat this to override the classifier.
pub const MATCH_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct SkillContext {
    pub message: InboundMessage,
    pub matched: SkillMatch,
    pub user_tier: u8,
    pub history: Vec<ChatMessage>,
    pub memories: Vec<String>,
}

impl SkillContext {
    pub fn text(&self) -> &str {
        &self.message.content
    }

    pub fn sender(&self) -> &str {
        self.message.sender_id.as_str()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SkillResponse {
    pub text: String,
    pub metadata: serde_json::Value,
    pub suggestions: Vec<String>,
    pub error: Option<String>,
}

impl SkillResponse {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// The message doubles as the user-facing text.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            text: message.clone(),
            error: Some(message),
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait Skill: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn min_tier(&self) -> u8;

    fn examples(&self) -> &'static [&'static str];

    /// Confidence that this skill should take `text` regardless of the
    /// classifier. Most skills rely on the classifier alone.
    fn can_handle(&self, _text: &str) -> f64 {
        0.0
    }

    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse>;
}

#[derive(Debug, Clone, Serialize)]
pub struct SkillInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub min_tier: u8,
    pub examples: &'static [&'static str],
}

/// Skills in registration order.
#[derive(Default, Clone)]
pub struct SkillRegistry {
    skills: Vec<Arc<dyn Skill>>,
}

impl SkillRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an existing skill with the same name.
    pub fn register(&mut self, skill: Arc<dyn Skill>) {
        tracing::info!(skill = skill.name(), min_tier = skill.min_tier(), "registered skill");
        if let Some(slot) = self.skills.iter_mut().find(|s| s.name() == skill.name()) {
            *slot = skill;
        } else {
            self.skills.push(skill);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Skill>> {
        self.skills.iter().find(|s| s.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.skills.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn list(&self) -> Vec<SkillInfo> {
        self.skills
            .iter()
            .map(|s| SkillInfo {
                name: s.name(),
                description: s.description(),
                min_tier: s.min_tier(),
                examples: s.examples(),
            })
            .collect()
    }

    /// Highest `can_handle` score strictly above [`MATCH_THRESHOLD`]. Ties
    /// keep the earlier registration.
    pub fn find_best_match(&self, text: &str) -> Option<SkillMatch> {
        let mut best: Option<SkillMatch> = None;
        let mut best_score = MATCH_THRESHOLD;
        for skill in &self.skills {
            let score = skill.can_handle(text);
            if score > best_score {
                best_score = score;
                best = Some(SkillMatch::new(skill.name(), score));
            }
        }
        best
    }

    /// One line per skill for the LLM classifier prompt.
    pub fn descriptions(&self) -> String {
        self.skills
            .iter()
            .map(|s| {
                let examples = s
                    .examples()
                    .iter()
                    .take(3)
                    .map(|e| format!("\"{e}\""))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("- {}: {} (e.g. {examples})", s.name(), s.description())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// First `max` characters, on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
