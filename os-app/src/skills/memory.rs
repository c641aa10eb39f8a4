use super::{Skill, SkillContext, SkillResponse};
use crate::store::MemoryStore;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, LazyLock};

const FACT_CATEGORY: &str = "fact";
const LIST_LIMIT: usize = 10;

static REMEMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bremember\s+(that\s+)?(?P<content>.+)").expect("valid memory regex")
});
static RECALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwhat do you (know|remember) about\s+(?P<query>.+)")
        .expect("valid memory regex")
});
static FORGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bforget\s+(about\s+)?(?P<target>.+)").expect("valid memory regex")
});

#[derive(Debug, PartialEq, Eq)]
enum MemoryCommand {
    Remember(String),
    Recall(String),
    Forget(String),
    List,
}

/// Facts a user asked to keep, scoped to that user.
pub struct MemorySkill {
    store: Arc<MemoryStore>,
}

impl MemorySkill {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }
}

fn clean(value: &str) -> String {
    value
        .trim()
        .trim_end_matches(['?', '.', '!'])
        .trim()
        .to_string()
}

fn parse_command(ctx: &SkillContext) -> MemoryCommand {
    let entities = &ctx.matched;
    if let Some(content) = entities.entity("content") {
        return MemoryCommand::Remember(clean(content));
    }
    if let Some(query) = entities.entity("query") {
        return MemoryCommand::Recall(clean(query));
    }
    if let Some(target) = entities.entity("target") {
        return MemoryCommand::Forget(clean(target));
    }

    // Entities are missing when the classifier was not the regex table.
    let text = ctx.text().trim();
    if let Some(caps) = RECALL.captures(text) {
        return MemoryCommand::Recall(clean(&caps["query"]));
    }
    if let Some(caps) = FORGET.captures(text) {
        return MemoryCommand::Forget(clean(&caps["target"]));
    }
    if let Some(caps) = REMEMBER.captures(text) {
        return MemoryCommand::Remember(clean(&caps["content"]));
    }
    MemoryCommand::List
}

#[async_trait]
impl Skill for MemorySkill {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn description(&self) -> &'static str {
        "Remember, recall and forget facts about you"
    }

    fn min_tier(&self) -> u8 {
        0
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "remember that my sister's birthday is June 3",
            "what do you know about my car",
            "forget about the old wifi password",
        ]
    }

    #[tracing::instrument(level = "info", skip_all, fields(sender_id = ctx.sender()))]
    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let user = ctx.sender();
        let reply = match parse_command(ctx) {
            MemoryCommand::Remember(content) if content.is_empty() => {
                return Ok(SkillResponse::error("What should I remember?"));
            }
            MemoryCommand::Remember(content) => {
                self.store
                    .add_memory(user, &content, FACT_CATEGORY, Utc::now())?;
                format!("Got it. I'll remember that {content}.")
            }
            MemoryCommand::Recall(query) => {
                let found = self.store.search_memories(user, &query, LIST_LIMIT)?;
                if found.is_empty() {
                    format!("I don't have anything remembered about {query}.")
                } else {
                    let mut lines = vec![format!("Here's what I remember about {query}:")];
                    lines.extend(found.iter().map(|m| format!("  - {}", m.content)));
                    lines.join("\n")
                }
            }
            MemoryCommand::Forget(target) => {
                let removed = self.store.forget_memories(user, &target)?;
                match removed {
                    0 => format!("I had nothing remembered about {target}."),
                    1 => format!("Forgot 1 memory about {target}."),
                    n => format!("Forgot {n} memories about {target}."),
                }
            }
            MemoryCommand::List => {
                let all = self.store.memories(user, None, LIST_LIMIT)?;
                if all.is_empty() {
                    "I haven't remembered anything for you yet.".to_string()
                } else {
                    let mut lines = vec!["Things I remember:".to_string()];
                    lines.extend(all.iter().map(|m| format!("  - {}", m.content)));
                    lines.join("\n")
                }
            }
        };
        Ok(SkillResponse::reply(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{SkillMatch, classify};
    use os_channels::{Channel, InboundMessage};

    fn ctx(text: &str) -> SkillContext {
        SkillContext {
            message: InboundMessage::text(Channel::Telegram, "u1", text),
            matched: classify(text, &[]),
            user_tier: 1,
            history: Vec::new(),
            memories: Vec::new(),
        }
    }

    fn skill() -> MemorySkill {
        MemorySkill::new(Arc::new(MemoryStore::open_in_memory().expect("store")))
    }

    #[tokio::test]
    async fn remember_recall_forget_cycle() {
        let skill = skill();
        let out = skill
            .execute(&ctx("remember that the garage code is 4471"))
            .await
            .expect("remember");
        assert_eq!(out.text, "Got it. I'll remember that the garage code is 4471.");

        let out = skill
            .execute(&ctx("what do you know about the garage?"))
            .await
            .expect("recall");
        assert!(out.text.contains("the garage code is 4471"), "{}", out.text);

        let out = skill
            .execute(&ctx("forget about garage"))
            .await
            .expect("forget");
        assert_eq!(out.text, "Forgot 1 memory about garage.");

        let out = skill.execute(&ctx("memories please")).await.expect("list");
        assert_eq!(out.text, "I haven't remembered anything for you yet.");
    }

    #[test]
    fn falls_back_to_text_when_entities_missing() {
        let mut c = ctx("Please forget about my old address");
        c.matched = SkillMatch::new("memory", 0.7);
        assert_eq!(
            parse_command(&c),
            MemoryCommand::Forget("my old address".to_string())
        );
    }
}
