//! Intent classification: regex table, keyword heuristics, then an optional
//! LLM pass over the registered skill descriptions.

use os_llm::{InferenceRouter, ProviderKind};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const CONVERSATION_SKILL: &str = "conversation";
pub const REGEX_CONFIDENCE: f64 = 0.95;
pub const LLM_CONFIDENCE: f64 = 0.7;
const LLM_FAILURE_CONFIDENCE: f64 = 0.3;
const FALLBACK_CONFIDENCE: f64 = 0.5;

const CLASSIFIER_SYSTEM_PROMPT: &str = "You are an intent classifier. Reply with only the skill name.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkillMatch {
    pub skill_name: String,
    pub confidence: f64,
    /// Named captures from the matching pattern, trimmed.
    pub entities: BTreeMap<String, String>,
    pub raw_intent: Option<String>,
}

impl SkillMatch {
    pub fn new(skill_name: impl Into<String>, confidence: f64) -> Self {
        Self {
            skill_name: skill_name.into(),
            confidence,
            entities: BTreeMap::new(),
            raw_intent: None,
        }
    }

    pub fn entity(&self, name: &str) -> Option<&str> {
        self.entities.get(name).map(String::as_str)
    }
}

/// Checked in order; the first matching pattern wins.
static REGEX_TABLE: LazyLock<Vec<(&'static str, Vec<Regex>)>> = LazyLock::new(|| {
    let table: [(&str, &[&str]); 6] = [
        (
            "system_admin",
            &[
                r"\b(disk|storage)\s*(space|usage|free)\b",
                r"\b(cpu|memory|ram|mem)\s*(usage|load|status)\b",
                r"\bdocker\s+(?P<action>ps|status|restart|logs|stats)\b",
                r"\b(?P<action>restart|stop|start)\s+(service|container|docker)\s+(?P<target>\w+)\b",
                r"\buptime\b",
                r"\bsystem\s*(status|health|info)\b",
                r"\bcheck\s+(?P<target>disk|cpu|memory|ram|services?|ports?)\b",
            ],
        ),
        (
            "daily_briefing",
            &[
                r"\b(daily\s*)?briefing\b",
                r"\bwhat('s| is) (on )?(my )?(schedule|calendar|agenda)\b",
                r"\bwhat('s| is) (on )?(for )?today\b",
                r"\bmorning\s*(report|update|summary)\b",
                r"\bmy\s*tasks?\b",
            ],
        ),
        (
            "web_search",
            &[
                r"\bsearch\s+(for\s+)?(?P<query>.+)",
                r"\bgoogle\s+(?P<query>.+)",
                r"\blook\s*up\s+(?P<query>.+)",
                r"\bfind\s+(info|information)\s+(about|on)\s+(?P<query>.+)",
            ],
        ),
        (
            "smart_home",
            &[
                r"\bturn\s+(?P<action>on|off)\s+(the\s+)?(?P<device>.+)",
                r"\b(?P<action>dim|brighten)\s+(the\s+)?(?P<device>.+)",
                r"\bset\s+(the\s+)?(?P<device>.+?)\s+to\s+(?P<value>.+)",
                r"\b(?P<device>lights?|lamp|fan|ac|thermostat)\s+(?P<action>on|off)\b",
                r"\b(?P<action>lock|unlock)\s+(the\s+)?(?P<device>.+)",
            ],
        ),
        (
            "security_monitor",
            &[
                r"\b(security|intrusion)\s*(check|status|scan|report)\b",
                r"\bopen\s*ports?\b",
                r"\bfail2ban\s*(status|report)\b",
                r"\bsuspicious\s*(activity|connections?|login)\b",
            ],
        ),
        (
            "memory",
            &[
                r"\bremember\s+(that\s+)?(?P<content>.+)",
                r"\bwhat do you (know|remember) about\s+(?P<query>.+)",
                r"\bforget\s+(about\s+)?(?P<target>.+)",
            ],
        ),
    ];
    table
        .into_iter()
        .map(|(skill, patterns)| {
            let compiled = patterns
                .iter()
                .map(|p| Regex::new(p).expect("valid intent regex"))
                .collect();
            (skill, compiled)
        })
        .collect()
});

const KEYWORDS: &[(&str, &[&str])] = &[
    (
        "system_admin",
        &["server", "ssh", "process", "service", "nginx", "systemctl", "journalctl"],
    ),
    (
        "daily_briefing",
        &["calendar", "schedule", "tasks", "todos", "agenda", "plan"],
    ),
    (
        "web_search",
        &["search", "look up", "find out", "what is", "who is", "when did"],
    ),
    (
        "smart_home",
        &["light", "switch", "temperature", "thermostat", "door", "camera"],
    ),
    (
        "security_monitor",
        &["security", "firewall", "attack", "breach", "vulnerability"],
    ),
];

/// Regex then keyword classification, restricted to `available` when it is
/// non-empty. Falls back to `conversation`.
pub fn classify(text: &str, available: &[String]) -> SkillMatch {
    let text = text.trim().to_lowercase();
    let allowed = |skill: &str| available.is_empty() || available.iter().any(|s| s == skill);

    for (skill, patterns) in REGEX_TABLE.iter() {
        if !allowed(skill) {
            continue;
        }
        for re in patterns {
            let Some(caps) = re.captures(&text) else {
                continue;
            };
            let entities = re
                .capture_names()
                .flatten()
                .filter_map(|name| {
                    let value = caps.name(name)?.as_str().trim();
                    (!value.is_empty()).then(|| (name.to_string(), value.to_string()))
                })
                .collect();
            return SkillMatch {
                skill_name: skill.to_string(),
                confidence: REGEX_CONFIDENCE,
                entities,
                raw_intent: Some(re.as_str().to_string()),
            };
        }
    }

    let mut best: Option<(&str, usize)> = None;
    for (skill, keywords) in KEYWORDS {
        if !allowed(skill) {
            continue;
        }
        let hits = keywords.iter().filter(|kw| text.contains(*kw)).count();
        if hits > best.map_or(0, |(_, n)| n) {
            best = Some((skill, hits));
        }
    }
    if let Some((skill, hits)) = best {
        let confidence = (0.5 + hits as f64 * 0.15).min(0.8);
        return SkillMatch::new(skill, confidence);
    }

    SkillMatch::new(CONVERSATION_SKILL, FALLBACK_CONFIDENCE)
}

/// Asks the local model to pick one of `known` skills. Unknown answers and
/// inference failures both land on `conversation`.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn classify_with_llm(
    router: &InferenceRouter,
    text: &str,
    descriptions: &str,
    known: &[String],
) -> SkillMatch {
    let prompt = format!(
        "Classify the following user message into exactly one skill category.\n\n\
         Available skills:\n{descriptions}\n\n\
         User message: \"{text}\"\n\n\
         Reply with ONLY the skill name, nothing else."
    );
    match router
        .generate(
            &prompt,
            Some(CLASSIFIER_SYSTEM_PROMPT),
            Some(ProviderKind::Ollama),
            0.1,
        )
        .await
    {
        Ok(completion) => {
            let answer = normalize_skill_answer(&completion.text);
            if known.iter().any(|s| *s == answer) {
                let mut out = SkillMatch::new(answer, LLM_CONFIDENCE);
                out.raw_intent = Some("llm".to_string());
                out
            } else {
                tracing::debug!(%answer, "classifier answered with an unknown skill");
                SkillMatch::new(CONVERSATION_SKILL, LLM_CONFIDENCE)
            }
        }
        Err(error) => {
            tracing::warn!(%error, "llm intent classification failed");
            SkillMatch::new(CONVERSATION_SKILL, LLM_FAILURE_CONFIDENCE)
        }
    }
}

fn normalize_skill_answer(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace(['"', '\'', '`', '.'], "")
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, router_with};
    use std::sync::Arc;

    fn all() -> Vec<String> {
        Vec::new()
    }

    #[test]
    fn regex_matches_capture_entities() {
        let m = classify("Please restart service nginx now", &all());
        assert_eq!(m.skill_name, "system_admin");
        assert_eq!(m.confidence, REGEX_CONFIDENCE);
        assert_eq!(m.entity("action"), Some("restart"));
        assert_eq!(m.entity("target"), Some("nginx"));

        let m = classify("Turn off the kitchen lights", &all());
        assert_eq!(m.skill_name, "smart_home");
        assert_eq!(m.entity("action"), Some("off"));
        assert_eq!(m.entity("device"), Some("kitchen lights"));

        let m = classify("remember that my wifi password is in the drawer", &all());
        assert_eq!(m.skill_name, "memory");
        assert_eq!(m.entity("content"), Some("my wifi password is in the drawer"));
    }

    #[test]
    fn table_order_decides_overlaps() {
        let m = classify("search for my tasks", &all());
        assert_eq!(m.skill_name, "daily_briefing");

        let m = classify("check memory", &all());
        assert_eq!(m.skill_name, "system_admin");
        assert_eq!(m.entity("target"), Some("memory"));
    }

    #[test]
    fn keywords_scale_confidence_and_cap() {
        let m = classify("the firewall", &all());
        assert_eq!(m.skill_name, "security_monitor");
        assert!((m.confidence - 0.65).abs() < 1e-9);

        let m = classify("security firewall attack breach", &all());
        assert_eq!(m.skill_name, "security_monitor");
        assert!((m.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn unavailable_skills_are_skipped() {
        let only_conversation = vec!["conversation".to_string()];
        let m = classify("what's on my calendar", &only_conversation);
        assert_eq!(m.skill_name, CONVERSATION_SKILL);
        assert_eq!(m.confidence, 0.5);
    }

    #[test]
    fn chit_chat_falls_back_to_conversation() {
        let m = classify("hello there", &all());
        assert_eq!(m.skill_name, CONVERSATION_SKILL);
        assert!(m.entities.is_empty());
    }

    #[tokio::test]
    async fn llm_answer_is_normalized_against_known_skills() {
        let local = Arc::new(FakeBackend::local().replying("\"Web_Search\"."));
        let router = router_with(local.clone(), Arc::new(FakeBackend::cloud()));
        let known = vec!["web_search".to_string(), "conversation".to_string()];

        let m = classify_with_llm(&router, "who won", "- web_search: ...", &known).await;
        assert_eq!(m.skill_name, "web_search");
        assert_eq!(m.confidence, LLM_CONFIDENCE);
        assert_eq!(m.raw_intent.as_deref(), Some("llm"));

        let calls = local.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].system.as_deref().unwrap_or("").contains("intent classifier"));
    }

    #[tokio::test]
    async fn unknown_llm_answer_becomes_conversation() {
        let local = Arc::new(FakeBackend::local().replying("book_a_flight"));
        let router = router_with(local, Arc::new(FakeBackend::cloud()));
        let known = vec!["web_search".to_string(), "conversation".to_string()];

        let m = classify_with_llm(&router, "fly me to rome", "", &known).await;
        assert_eq!(m.skill_name, CONVERSATION_SKILL);
        assert_eq!(m.confidence, LLM_CONFIDENCE);
    }

    #[tokio::test]
    async fn llm_failure_returns_low_confidence_conversation() {
        let router = router_with(
            Arc::new(FakeBackend::local().failing()),
            Arc::new(FakeBackend::cloud().unavailable()),
        );
        let m = classify_with_llm(&router, "???", "", &["memory".to_string()]).await;
        assert_eq!(m.skill_name, CONVERSATION_SKILL);
        assert_eq!(m.confidence, 0.3);
    }
}
