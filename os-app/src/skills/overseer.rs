use super::{Skill, SkillContext, SkillResponse};
use crate::overseer::OverseerAgent;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

const STRONG: &[&str] = &["overseer", "keyvault", "key vault"];
const LIKELY: &[&str] = &[
    "security audit",
    "security agent",
    "security protocol",
    "run audit",
    "agent status",
    "pending approval",
    "api key",
];

/// Chat front end for the overseer agent.
pub struct OverseerSkill {
    overseer: Arc<OverseerAgent>,
}

impl OverseerSkill {
    pub fn new(overseer: Arc<OverseerAgent>) -> Self {
        Self { overseer }
    }
}

#[async_trait]
impl Skill for OverseerSkill {
    fn name(&self) -> &'static str {
        "overseer"
    }

    fn description(&self) -> &'static str {
        "Security overseer: manage security agents, run audits, \
         approve policy changes, view security reports"
    }

    fn min_tier(&self) -> u8 {
        3
    }

    fn examples(&self) -> &'static [&'static str] {
        &[
            "overseer status",
            "overseer audit",
            "overseer last report",
            "overseer start agent",
            "overseer stop agent",
            "overseer pending",
        ]
    }

    fn can_handle(&self, text: &str) -> f64 {
        let lower = text.to_lowercase();
        if STRONG.iter().any(|w| lower.contains(w)) {
            0.95
        } else if LIKELY.iter().any(|w| lower.contains(w)) {
            0.85
        } else {
            0.0
        }
    }

    async fn execute(&self, ctx: &SkillContext) -> Result<SkillResponse> {
        let reply = self.overseer.handle_command(ctx.text(), ctx.sender()).await;
        Ok(SkillResponse::reply(reply))
    }
}
