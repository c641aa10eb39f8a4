//! Slash commands answered before the skill pipeline.

use crate::access::ADMIN_TIER;
use crate::pairing::PairingGate;
use crate::skills::SkillRegistry;
use chrono::{DateTime, Utc};
use os_llm::InferenceRouter;

const SUPPORTED: &str = "/start /help /skills /budget /pair";

/// What slash commands can see.
pub struct CommandContext<'a> {
    pub assistant_name: &'a str,
    pub registry: &'a SkillRegistry,
    pub router: &'a InferenceRouter,
    pub pairing: &'a PairingGate,
}

/// Returns the reply for a slash command, or `None` when `input` is not one.
pub fn handle_command(
    ctx: &CommandContext<'_>,
    sender_tier: u8,
    input: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    // Telegram appends the bot name in groups: `/help@my_bot`.
    let command = parts
        .next()
        .unwrap_or_default()
        .split('@')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();

    let reply = match command.as_str() {
        "/start" => format!(
            "Hello! I'm {}, your personal assistant. Send /help to see what I can do.",
            ctx.assistant_name
        ),
        "/help" => help_text(ctx),
        "/skills" => skills_text(ctx, sender_tier),
        "/budget" => budget_text(ctx, now),
        "/pair" => pair_command(ctx, sender_tier, &args, now),
        _ => format!("Unknown command. Supported: {SUPPORTED}"),
    };
    Some(reply)
}

fn help_text(ctx: &CommandContext<'_>) -> String {
    let mut lines = vec![
        format!("**{}** understands plain language. A few things to try:", ctx.assistant_name),
    ];
    for info in ctx.registry.list() {
        if let Some(example) = info.examples.first() {
            lines.push(format!("  - \"{example}\" ({})", info.name));
        }
    }
    lines.push(String::new());
    lines.push(format!("Commands: {SUPPORTED}"));
    lines.join("\n")
}

fn skills_text(ctx: &CommandContext<'_>, sender_tier: u8) -> String {
    let mut lines = vec!["**Skills:**".to_string()];
    for info in ctx.registry.list() {
        let marker = if sender_tier >= info.min_tier { "" } else { " (locked)" };
        lines.push(format!(
            "  - `{}` tier {}{marker}: {}",
            info.name, info.min_tier, info.description
        ));
    }
    lines.join("\n")
}

fn budget_text(ctx: &CommandContext<'_>, now: DateTime<Utc>) -> String {
    match ctx.router.costs().budget_status(now) {
        Ok(status) => format!(
            "**Cloud budget this month:** ${:.4} of ${:.2} used ({:.1}%), ${:.2} remaining.",
            status.spent_usd, status.budget_usd, status.utilization_pct, status.remaining_usd
        ),
        Err(error) => {
            tracing::warn!(%error, "budget status unavailable");
            "Budget status is unavailable right now.".to_string()
        }
    }
}

fn pair_command(ctx: &CommandContext<'_>, sender_tier: u8, args: &[&str], now: DateTime<Utc>) -> String {
    if sender_tier < ADMIN_TIER {
        return "Only admins can manage pairing requests.".to_string();
    }
    match args {
        [] | ["list"] => {
            let pending = ctx.pairing.pending(now);
            if pending.is_empty() {
                return "No pending pairing requests.".to_string();
            }
            let mut lines = vec!["**Pending pairing requests:**".to_string()];
            for request in pending {
                lines.push(format!(
                    "  - `{}` {} sender {} (expires {})",
                    request.code,
                    request.channel.as_str(),
                    request.sender_id,
                    request.expires_at.format("%H:%M UTC")
                ));
            }
            lines.join("\n")
        }
        ["approve", code] => match ctx.pairing.approve(code, now) {
            Ok(request) => format!(
                "Paired {} sender {}. They can message me now.",
                request.channel.as_str(),
                request.sender_id
            ),
            Err(error) => error.to_string(),
        },
        ["reject", code] => match ctx.pairing.reject(code, now) {
            Ok(request) => format!(
                "Rejected pairing for {} sender {}.",
                request.channel.as_str(),
                request.sender_id
            ),
            Err(error) => error.to_string(),
        },
        _ => "Usage: /pair [list] | /pair approve <code> | /pair reject <code>".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DmPolicy, SecurityConfig};
    use crate::skills::MemorySkill;
    use crate::store::MemoryStore;
    use crate::testing::local_router;
    use chrono::TimeZone;
    use os_channels::Channel;
    use std::sync::{Arc, RwLock};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    struct Env {
        registry: SkillRegistry,
        router: InferenceRouter,
        pairing: PairingGate,
    }

    impl Env {
        fn new() -> Self {
            let mut registry = SkillRegistry::new();
            let store = Arc::new(MemoryStore::open_in_memory().expect("store"));
            registry.register(Arc::new(MemorySkill::new(store)));
            let pairing = PairingGate::new(Arc::new(RwLock::new(SecurityConfig {
                dm_policy: DmPolicy::Pairing,
                ..SecurityConfig::default()
            })));
            Self {
                registry,
                router: local_router("ok"),
                pairing,
            }
        }

        fn ctx(&self) -> CommandContext<'_> {
            CommandContext {
                assistant_name: "Jarvis",
                registry: &self.registry,
                router: &self.router,
                pairing: &self.pairing,
            }
        }
    }

    #[test]
    fn plain_text_is_not_a_command() {
        let env = Env::new();
        assert!(handle_command(&env.ctx(), 1, "hello there", now()).is_none());
    }

    #[test]
    fn start_and_unknown_commands() {
        let env = Env::new();
        let start = handle_command(&env.ctx(), 1, "/start@jarvis_bot", now()).expect("reply");
        assert!(start.starts_with("Hello! I'm Jarvis"));
        let unknown = handle_command(&env.ctx(), 1, "/dance", now()).expect("reply");
        assert_eq!(unknown, format!("Unknown command. Supported: {SUPPORTED}"));
    }

    #[test]
    fn skills_and_budget_listing() {
        let env = Env::new();
        let skills = handle_command(&env.ctx(), 1, "/skills", now()).expect("reply");
        assert!(skills.contains("`memory` tier 0"));
        let budget = handle_command(&env.ctx(), 1, "/budget", now()).expect("reply");
        assert!(budget.contains("$0.0000 of $50.00"), "{budget}");
    }

    #[test]
    fn pairing_requires_admin_and_approves_codes() {
        let env = Env::new();
        let decision = env.pairing.evaluate(Channel::Telegram, "stranger", now());
        let crate::pairing::GateDecision::PairingRequired { code, .. } = decision else {
            panic!("expected pairing request");
        };

        let denied = handle_command(&env.ctx(), 1, &format!("/pair approve {code}"), now());
        assert_eq!(denied.as_deref(), Some("Only admins can manage pairing requests."));

        let listed = handle_command(&env.ctx(), ADMIN_TIER, "/pair", now()).expect("reply");
        assert!(listed.contains(&code));

        let approved =
            handle_command(&env.ctx(), ADMIN_TIER, &format!("/pair approve {code}"), now())
                .expect("reply");
        assert_eq!(approved, "Paired telegram sender stranger. They can message me now.");
        assert!(env.pairing.evaluate(Channel::Telegram, "stranger", now()).is_allowed());
    }
}
